//! Per-bucket I/O plans.

use super::{Direction, Query, ReadHints};
use crate::error::{Result, StoreError};
use crate::format::timeindex::{file_size, time_to_offset};
use crate::format::{BucketInfo, DataShape, RecordType, HEADER_SIZE};
use crate::key::BucketKey;
use chrono::Datelike;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Byte window of one year file to read.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FilePlan {
    pub path: PathBuf,
    pub year: i16,
    pub timeframe: Duration,
    pub intervals_per_day: i64,
    pub offset: i64,
    pub length: i64,
    /// The window reaches the end of the file, so the last live slot found
    /// scanning backward is the last live slot of the file.
    pub seeking_last: bool,
}

/// Everything needed to read one bucket.
///
/// `files` covers the query range in ascending year order. `prev_files`
/// covers everything before the range start and is only used to find the
/// timestamp preceding the range.
#[derive(Debug, Clone)]
pub(crate) struct IoPlan {
    pub key: BucketKey,
    pub record_length: i32,
    pub record_type: RecordType,
    pub variable_record_length: i32,
    pub shapes: Vec<DataShape>,
    pub files: Vec<FilePlan>,
    pub prev_files: Vec<FilePlan>,
}

impl IoPlan {
    pub(crate) fn new(
        key: BucketKey,
        infos: &[Arc<BucketInfo>],
        query: &Query,
        hints: &ReadHints,
    ) -> Result<Self> {
        let mut infos = infos.to_vec();
        infos.sort_by_key(|info| info.year);
        let first = infos
            .first()
            .ok_or_else(|| StoreError::BucketNotFound(key.to_string()))?;

        let mut plan = Self {
            key: key.clone(),
            record_length: first.record_length(),
            record_type: first.record_type(),
            variable_record_length: first.variable_record_length(),
            shapes: first.shapes().to_vec(),
            files: Vec::new(),
            prev_files: Vec::new(),
        };
        let start_year = query.start().map(|t| t.year());
        let end_year = query.end().map(|t| t.year());

        for info in &infos {
            let record_len = info.record_length();
            if record_len != plan.record_length {
                return Err(StoreError::RecordLengthNotConsistent {
                    expected: plan.record_length,
                    actual: record_len,
                });
            }
            let year = i32::from(info.year);
            let timeframe = info.timeframe().duration();
            let file_end = file_size(timeframe, year, record_len);
            let max_length = file_end - HEADER_SIZE + i64::from(record_len);
            let file_plan = |offset: i64, length: i64| FilePlan {
                path: info.path.clone(),
                year: info.year,
                timeframe,
                intervals_per_day: info.intervals_per_day(),
                offset,
                length,
                seeking_last: false,
            };

            if start_year.is_some_and(|start| year < start) {
                plan.prev_files.push(file_plan(HEADER_SIZE, file_end - HEADER_SIZE));
                continue;
            }
            if end_year.is_some_and(|end| year > end) {
                continue;
            }

            let mut start_offset = HEADER_SIZE;
            let mut end_offset = file_end;
            if let Some(start) = query.start().filter(|t| t.year() == year) {
                start_offset = time_to_offset(start, timeframe, record_len);
            }
            if let Some(end) = query.end().filter(|t| t.year() == year) {
                end_offset = (time_to_offset(end, timeframe, record_len) + i64::from(record_len))
                    .min(file_end);
            }
            let reaches_end = end_offset == file_end;
            if let Some(last_known) = hints.get(&info.path) {
                end_offset = end_offset.min(last_known + i64::from(record_len));
            }

            let mut fp = file_plan(start_offset, (end_offset - start_offset).clamp(0, max_length));
            fp.seeking_last = reaches_end && query.direction() == Direction::Last;
            plan.files.push(fp);

            if start_year == Some(year) {
                plan.prev_files
                    .push(file_plan(HEADER_SIZE, start_offset - HEADER_SIZE));
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ElementType, Timeframe};
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    fn info(year: i16, shapes: Vec<DataShape>) -> Arc<BucketInfo> {
        Arc::new(BucketInfo::new(
            format!("/data/TEST/1Min/OHLCV/{year}.bin"),
            "plan",
            year,
            Timeframe::parse("1Min").unwrap(),
            shapes,
            RecordType::Fixed,
        ))
    }

    fn close() -> Vec<DataShape> {
        vec![DataShape::new("Close", ElementType::Float32)]
    }

    fn key() -> BucketKey {
        BucketKey::new("TEST", "1Min", "OHLCV").unwrap()
    }

    #[test]
    fn test_plan_windows() {
        let infos = vec![info(2021, close()), info(2019, close()), info(2020, close())];
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 10, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 19, 0).unwrap();
        let query = Query::for_key(key()).with_range(start, end);
        let plan = IoPlan::new(key(), &infos, &query, &ReadHints::new()).unwrap();

        assert_eq!(plan.record_length, 16);
        assert_eq!(plan.files.len(), 1);
        let fp = &plan.files[0];
        assert_eq!(fp.year, 2020);
        assert_eq!(fp.offset, HEADER_SIZE + 10 * 16);
        assert_eq!(fp.length, 10 * 16);
        assert!(!fp.seeking_last);

        let prev: Vec<i16> = plan.prev_files.iter().map(|p| p.year).collect();
        assert_eq!(prev, vec![2019, 2020]);
        assert_eq!(plan.prev_files[1].length, 10 * 16);
    }

    #[test]
    fn test_plan_hint_and_seeking_last() {
        let infos = vec![info(2020, close())];
        let hints = ReadHints::new();
        hints.raise(Path::new("/data/TEST/1Min/OHLCV/2020.bin"), HEADER_SIZE + 99 * 16);

        let query = Query::for_key(key()).with_limit(5, Direction::Last);
        let plan = IoPlan::new(key(), &infos, &query, &hints).unwrap();
        let fp = &plan.files[0];
        assert_eq!(fp.offset, HEADER_SIZE);
        assert_eq!(fp.length, 100 * 16);
        assert!(fp.seeking_last);
        assert!(plan.prev_files.is_empty());
    }

    #[test]
    fn test_plan_rejects_mixed_record_lengths() {
        let wide = vec![
            DataShape::new("Close", ElementType::Float64),
            DataShape::new("Volume", ElementType::Int64),
        ];
        let infos = vec![info(2019, close()), info(2020, wide)];
        let err = IoPlan::new(key(), &infos, &Query::for_key(key()), &ReadHints::new()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::RecordLengthNotConsistent {
                expected: 16,
                actual: 24
            }
        ));
    }
}
