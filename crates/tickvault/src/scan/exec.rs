//! Slot reads for an [`IoPlan`].

use super::plan::{FilePlan, IoPlan};
use super::{ReadHints, RECORDS_PER_READ};
use crate::error::Result;
use crate::format::timeindex::{index_to_epoch, interval_start_epoch};
use crate::format::{RecordType, EPOCH_LEN};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use tracing::trace;

/// Live slots of one chunk, with the index word replaced by an epoch.
struct Packed {
    data: Vec<u8>,
    last_live_offset: Option<i64>,
}

impl IoPlan {
    /// Reads live slots of `file` in ascending order into `buf`, stopping
    /// once `limit` slots have been collected. Returns true if the limit was
    /// reached.
    pub(crate) fn read_forward(
        &self,
        file: &FilePlan,
        limit: Option<usize>,
        buf: &mut Vec<u8>,
    ) -> Result<bool> {
        if limit == Some(0) {
            return Ok(true);
        }
        let record_len = self.record_length as usize;
        let total = file.length as usize / record_len;
        if total == 0 {
            return Ok(false);
        }
        let mut fd = File::open(&file.path)?;
        let mut first = 0;
        while first < total {
            let count = RECORDS_PER_READ.min(total - first);
            let offset = file.offset + (first * record_len) as i64;
            let chunk = read_range(&mut fd, offset, count * record_len)?;
            let packed = self.pack(file, &chunk, offset);
            buf.extend_from_slice(&packed.data);
            if let Some(limit) = limit {
                if buf.len() / record_len >= limit {
                    buf.truncate(limit * record_len);
                    return Ok(true);
                }
            }
            first += count;
        }
        Ok(false)
    }

    /// Reads up to `need` live slots from the end of `file`, returned in
    /// ascending order.
    ///
    /// When the plan reaches the end of the file the offset of the last live
    /// slot found is recorded in `hints`.
    pub(crate) fn read_backward(
        &self,
        file: &FilePlan,
        need: usize,
        hints: &ReadHints,
    ) -> Result<Vec<u8>> {
        let record_len = self.record_length as usize;
        let total = file.length as usize / record_len;
        if need == 0 || total == 0 {
            return Ok(Vec::new());
        }
        let mut fd = File::open(&file.path)?;
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut found = 0;
        let mut end = total;
        let mut hinted = !file.seeking_last;
        while end > 0 && found < need {
            let count = RECORDS_PER_READ.min(end);
            let first = end - count;
            let offset = file.offset + (first * record_len) as i64;
            let chunk = read_range(&mut fd, offset, count * record_len)?;
            let packed = self.pack(file, &chunk, offset);
            if !hinted {
                if let Some(last) = packed.last_live_offset {
                    hints.raise(&file.path, last);
                    hinted = true;
                }
            }
            let rows = packed.data.len() / record_len;
            let keep = rows.min(need - found);
            chunks.push(packed.data[(rows - keep) * record_len..].to_vec());
            found += keep;
            end = first;
        }
        trace!(path = ?file.path, found, "backward scan");
        chunks.reverse();
        Ok(chunks.concat())
    }

    /// Drops holes and rewrites the index word of every live slot to the
    /// start of its interval.
    fn pack(&self, file: &FilePlan, chunk: &[u8], offset: i64) -> Packed {
        let record_len = self.record_length as usize;
        let year = i32::from(file.year);
        let mut packed = Packed {
            data: Vec::with_capacity(chunk.len()),
            last_live_offset: None,
        };
        for (i, slot) in chunk.chunks_exact(record_len).enumerate() {
            let index = i64::from_le_bytes(slot[..EPOCH_LEN].try_into().unwrap());
            if index == 0 {
                continue;
            }
            let epoch = match self.record_type {
                RecordType::Fixed => index_to_epoch(index, file.timeframe, year),
                RecordType::Variable => interval_start_epoch(index, file.intervals_per_day, year),
            };
            packed.data.extend_from_slice(&epoch.to_le_bytes());
            packed.data.extend_from_slice(&slot[EPOCH_LEN..]);
            packed.last_live_offset = Some(offset + (i * record_len) as i64);
        }
        packed
    }
}

/// Reads at most `len` bytes at `offset`; short files yield short buffers.
pub(crate) fn read_range(fd: &mut File, offset: i64, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    fd.seek(SeekFrom::Start(offset as u64))?;
    fd.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HEADER_SIZE;
    use crate::key::BucketKey;
    use crate::scan::tests::Fixture;
    use crate::scan::{Direction, Query};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_backward_scan_raises_hint() {
        let mut fx = Fixture::new();
        let key = BucketKey::new("TEST", "1Min", "OHLCV").unwrap();
        let t = |mi| Utc.with_ymd_and_hms(2020, 2, 1, 0, mi, 0).unwrap();
        fx.write_fixed(&key, &[(t(0), 1.0), (t(7), 2.0)]);

        let info = fx.catalog.bucket_info(&key, 2020).unwrap();
        fx.hints.forget(&info.path);
        let files = fx.catalog.year_files(&key);
        let query = Query::for_key(key.clone()).with_limit(1, Direction::Last);
        let plan = IoPlan::new(key, &files, &query, &fx.hints).unwrap();

        let rows = plan.read_backward(&plan.files[0], 1, &fx.hints).unwrap();
        assert_eq!(rows.len(), 16);
        assert_eq!(&rows[8..12], &2.0f32.to_le_bytes());
        let slot = HEADER_SIZE + (31 * 1440 + 7) * 16;
        assert_eq!(fx.hints.get(&info.path), Some(slot));
    }

    #[test]
    fn test_forward_scan_zero_limit() {
        let mut fx = Fixture::new();
        let key = BucketKey::new("TEST", "1Min", "OHLCV").unwrap();
        fx.write_fixed(&key, &[(Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap(), 1.0)]);
        let files = fx.catalog.year_files(&key);
        let plan = IoPlan::new(key.clone(), &files, &Query::for_key(key), &fx.hints).unwrap();

        let mut buf = Vec::new();
        assert!(plan.read_forward(&plan.files[0], Some(0), &mut buf).unwrap());
        assert!(buf.is_empty());
        assert!(!plan.read_forward(&plan.files[0], None, &mut buf).unwrap());
        assert_eq!(buf.len(), 16);
    }
}
