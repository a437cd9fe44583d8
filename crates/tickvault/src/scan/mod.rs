//! Scanning year files back into column series.
//!
//! A [`Query`] names buckets, an optional time range and an optional row
//! limit. The [`Reader`] builds one I/O plan per bucket and reads it:
//!
//! ```text
//! Query ──> IoPlan{files, prev files} ──FIRST──> forward scan  ──┐
//!                                     └─LAST───> backward scan ─┤
//!                   VARIABLE only: second stage ─ trim range/limit ┤
//!                                                               └─> ColumnSeries
//! ```
//!
//! Holes (slots with a zero index) are skipped and the index word of every
//! live slot is replaced by the epoch second of its interval. VARIABLE
//! buckets are read in two stages: the pointer slots first, then the row
//! groups they point at, producing an extra `Nanoseconds` column.

pub(crate) mod exec;
pub mod hint;
pub(crate) mod plan;
mod variable;

pub use hint::ReadHints;

use crate::catalog::Catalog;
use crate::columns::{ColumnSeries, ColumnSeriesMap};
use crate::context::StorageContext;
use crate::error::{Result, StoreError};
use crate::format::{DataShape, ElementType, RecordType, EPOCH_COLUMN, NANOSECONDS_COLUMN};
use crate::key::BucketKey;
use chrono::{DateTime, Utc};
use plan::IoPlan;
use std::sync::Arc;
use tracing::debug;

/// Number of slots read per I/O call.
pub const RECORDS_PER_READ: usize = 2000;

/// Which end of the range a row limit keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Oldest rows first.
    #[default]
    First,
    /// Newest rows; requires a limit.
    Last,
}

/// What to read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    keys: Vec<BucketKey>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    direction: Direction,
}

impl Query {
    /// Creates an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query over a single bucket.
    pub fn for_key(key: BucketKey) -> Self {
        Self::new().with_key(key)
    }

    /// Adds a bucket.
    pub fn with_key(mut self, key: BucketKey) -> Self {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        self
    }

    /// Restricts rows to `start..=end`.
    pub fn with_range(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.with_start(start).with_end(end)
    }

    /// Drops rows before `start`.
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Drops rows after `end`.
    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// Keeps at most `number` rows from the `direction` end of the range.
    pub fn with_limit(mut self, number: usize, direction: Direction) -> Self {
        self.limit = Some(number);
        self.direction = direction;
        self
    }

    /// Sets the direction without limiting the row count.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Buckets to read.
    pub fn keys(&self) -> &[BucketKey] {
        &self.keys
    }

    /// Range start, if any.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// Range end, if any.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Row limit, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Limit direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Executes a [`Query`] against the primary files.
#[derive(Debug)]
pub struct Reader {
    query: Query,
    plans: Vec<IoPlan>,
    hints: Arc<ReadHints>,
    compressed: bool,
}

impl Reader {
    /// Plans `query` against the buckets of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` for unknown buckets and
    /// `RecordLengthNotConsistent` if the year files of a bucket disagree.
    pub fn new(ctx: &StorageContext, query: Query) -> Result<Self> {
        Self::from_catalog(
            ctx.catalog(),
            Arc::clone(ctx.hints()),
            !ctx.config().disable_variable_compression,
            query,
        )
    }

    /// Plans `query` directly against a catalog.
    ///
    /// # Errors
    ///
    /// See [`Reader::new`].
    pub fn from_catalog(
        catalog: &Catalog,
        hints: Arc<ReadHints>,
        compressed: bool,
        query: Query,
    ) -> Result<Self> {
        let plans = query
            .keys
            .iter()
            .map(|key| {
                let files = catalog.year_files(key);
                if files.is_empty() {
                    return Err(StoreError::BucketNotFound(key.to_string()));
                }
                IoPlan::new(key.clone(), &files, &query, &hints)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            query,
            plans,
            hints,
            compressed,
        })
    }

    /// Reads every planned bucket.
    ///
    /// # Errors
    ///
    /// Returns `UnlimitedReverseScan` for LAST queries without a limit, or an
    /// I/O or decompression error.
    pub fn read(&self) -> Result<ColumnSeriesMap> {
        if self.query.direction == Direction::Last && self.query.limit.is_none() {
            return Err(StoreError::UnlimitedReverseScan);
        }
        let mut csm = ColumnSeriesMap::new();
        for plan in &self.plans {
            let series = self.read_plan(plan)?;
            debug!(key = %plan.key, rows = series.len(), "scanned bucket");
            csm.insert(plan.key.clone(), series);
        }
        Ok(csm)
    }

    fn read_plan(&self, plan: &IoPlan) -> Result<ColumnSeries> {
        let record_len = plan.record_length as usize;
        let slot_limit = slot_limit(plan.record_type, self.query.limit);
        let mut segments = Vec::with_capacity(plan.files.len());
        match self.query.direction {
            Direction::First => {
                let mut remaining = slot_limit;
                for (i, file) in plan.files.iter().enumerate() {
                    let mut buf = Vec::new();
                    let finished = plan.read_forward(file, remaining, &mut buf)?;
                    if let Some(left) = remaining.as_mut() {
                        *left -= buf.len() / record_len;
                    }
                    segments.push((i, buf));
                    if finished {
                        break;
                    }
                }
            }
            Direction::Last => {
                let mut remaining = slot_limit.unwrap_or_default();
                for (i, file) in plan.files.iter().enumerate().rev() {
                    if remaining == 0 {
                        break;
                    }
                    let buf = plan.read_backward(file, remaining, &self.hints)?;
                    remaining -= buf.len() / record_len;
                    segments.push((i, buf));
                }
                segments.reverse();
            }
        }

        let mut series = match plan.record_type {
            RecordType::Fixed => {
                let data: Vec<u8> = segments.into_iter().flat_map(|(_, buf)| buf).collect();
                ColumnSeries::from_rows(&output_shapes(plan), &data, record_len)
            }
            RecordType::Variable => {
                let row_len = plan.variable_record_length as usize + variable::EXTRA_ROW_LEN;
                let rows = variable::read_second_stage(plan, &segments, self.compressed)?;
                let rows = variable::trim_to_range(rows, row_len, self.query.start, self.query.end);
                let rows =
                    variable::trim_to_limit(rows, row_len, self.query.limit, self.query.direction);
                ColumnSeries::from_rows(&output_shapes(plan), &rows, row_len)
            }
        };

        if self.query.direction == Direction::First && self.query.start.is_some() {
            series.set_previous_epoch(self.previous_epoch(plan)?);
        }
        Ok(series)
    }

    /// Epoch of the last live slot before the range start.
    fn previous_epoch(&self, plan: &IoPlan) -> Result<Option<i64>> {
        for file in plan.prev_files.iter().rev() {
            let buf = plan.read_backward(file, 1, &self.hints)?;
            if let Some(word) = buf.get(..8) {
                return Ok(Some(i64::from_le_bytes(word.try_into().unwrap())));
            }
        }
        Ok(None)
    }
}

/// Number of slots to read for a row limit.
///
/// A VARIABLE slot holds at least one row, but the slot of the interval
/// containing the range boundary may lose all of its rows to the range trim.
/// One extra slot makes up for it; the row limit is applied after the trim.
fn slot_limit(record_type: RecordType, limit: Option<usize>) -> Option<usize> {
    match record_type {
        RecordType::Fixed => limit,
        RecordType::Variable => limit.map(|n| if n == 0 { 0 } else { n.saturating_add(1) }),
    }
}

fn output_shapes(plan: &IoPlan) -> Vec<DataShape> {
    let mut shapes = Vec::with_capacity(plan.shapes.len() + 2);
    shapes.push(DataShape::new(EPOCH_COLUMN, ElementType::Int64));
    shapes.extend(plan.shapes.iter().cloned());
    if plan.record_type == RecordType::Variable {
        shapes.push(DataShape::new(NANOSECONDS_COLUMN, ElementType::Int32));
    }
    shapes
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::columns::Column;
    use crate::config::SyncMode;
    use crate::format::timeindex::{interval_ticks, time_to_index, time_to_offset};
    use crate::format::{BucketInfo, Timeframe};
    use crate::txn::WriteCommand;
    use crate::wal::PrimaryWriter;
    use chrono::{Datelike, Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub temp_dir: TempDir,
        pub catalog: Catalog,
        pub hints: Arc<ReadHints>,
        pub writer: PrimaryWriter,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let catalog = Catalog::open(temp_dir.path()).unwrap();
            let hints = Arc::new(ReadHints::new());
            let writer = PrimaryWriter::new(temp_dir.path(), Arc::clone(&hints), true, SyncMode::None);
            Self {
                temp_dir,
                catalog,
                hints,
                writer,
            }
        }

        pub(crate) fn bucket(&self, key: &BucketKey, year: i16, record_type: RecordType) -> Arc<BucketInfo> {
            if self.catalog.contains(key) {
                return self.catalog.add_year_file(key, year).unwrap();
            }
            let info = BucketInfo::new(
                "",
                "test",
                year,
                Timeframe::parse(key.timeframe_str()).unwrap(),
                vec![DataShape::new("Close", ElementType::Float32)],
                record_type,
            );
            self.catalog.add_time_bucket(key, info).unwrap()
        }

        /// Writes one FIXED row per point.
        pub(crate) fn write_fixed(&mut self, key: &BucketKey, points: &[(DateTime<Utc>, f32)]) {
            for (t, close) in points {
                let info = self.bucket(key, i16::try_from(t.year()).unwrap(), RecordType::Fixed);
                let tf = info.timeframe().duration();
                let mut data = close.to_le_bytes().to_vec();
                data.resize(8, 0);
                let cmd = WriteCommand {
                    record_type: RecordType::Fixed,
                    wal_key_path: key.wal_key_path(info.year),
                    var_rec_len: 0,
                    offset: time_to_offset(*t, tf, info.record_length()),
                    index: time_to_index(*t, tf),
                    data,
                    shapes: info.shapes().to_vec(),
                };
                self.writer.write_file(&cmd.wal_key_path, &[&cmd]).unwrap();
            }
        }

        /// Writes VARIABLE rows, one command per row.
        pub(crate) fn write_variable(&mut self, key: &BucketKey, points: &[(DateTime<Utc>, f32)]) {
            for (t, close) in points {
                let info = self.bucket(key, i16::try_from(t.year()).unwrap(), RecordType::Variable);
                let tf = info.timeframe().duration();
                let index = time_to_index(*t, tf);
                let mut data = close.to_le_bytes().to_vec();
                data.extend_from_slice(&interval_ticks(*t, index, info.intervals_per_day()).to_le_bytes());
                let cmd = WriteCommand {
                    record_type: RecordType::Variable,
                    wal_key_path: key.wal_key_path(info.year),
                    var_rec_len: info.variable_record_length(),
                    offset: time_to_offset(*t, tf, info.record_length()),
                    index,
                    data,
                    shapes: info.shapes().to_vec(),
                };
                self.writer.write_file(&cmd.wal_key_path, &[&cmd]).unwrap();
            }
        }

        pub(crate) fn read(&self, query: Query) -> Result<ColumnSeries> {
            let key = query.keys()[0].clone();
            let reader = Reader::from_catalog(&self.catalog, Arc::clone(&self.hints), true, query)?;
            let mut csm = reader.read()?;
            Ok(csm.remove(&key).unwrap())
        }
    }

    fn t(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn closes(series: &ColumnSeries) -> Vec<f32> {
        match series.column("Close") {
            Some(Column::Float32(v)) => v.clone(),
            other => panic!("unexpected Close column: {other:?}"),
        }
    }

    fn key(tf: &str) -> BucketKey {
        BucketKey::new("TEST", tf, "OHLCV").unwrap()
    }

    #[test]
    fn test_forward_scan_skips_holes() {
        let mut fx = Fixture::new();
        let k = key("1Min");
        fx.write_fixed(&k, &[(t(2020, 1, 1, 0, 5), 5.0), (t(2020, 1, 1, 0, 1), 1.0), (t(2020, 1, 1, 0, 3), 3.0)]);

        let series = fx.read(Query::for_key(k.clone())).unwrap();
        assert_eq!(series.names(), &["Epoch", "Close"]);
        assert_eq!(closes(&series), vec![1.0, 3.0, 5.0]);
        let base = t(2020, 1, 1, 0, 0).timestamp();
        assert_eq!(series.epochs().unwrap(), &[base + 60, base + 180, base + 300]);
        assert_eq!(series.previous_epoch(), None);

        let ranged = fx
            .read(Query::for_key(k).with_range(t(2020, 1, 1, 0, 2), t(2020, 1, 1, 0, 3)))
            .unwrap();
        assert_eq!(closes(&ranged), vec![3.0]);
        assert_eq!(ranged.previous_epoch(), Some(base + 60));
    }

    #[test]
    fn test_first_and_last_limits() {
        let mut fx = Fixture::new();
        let k = key("1Min");
        let points: Vec<_> = (0..10).map(|i| (t(2020, 3, 1, 9, i), i as f32)).collect();
        fx.write_fixed(&k, &points);

        let first = fx.read(Query::for_key(k.clone()).with_limit(3, Direction::First)).unwrap();
        assert_eq!(closes(&first), vec![0.0, 1.0, 2.0]);
        let last = fx.read(Query::for_key(k.clone()).with_limit(3, Direction::Last)).unwrap();
        assert_eq!(closes(&last), vec![7.0, 8.0, 9.0]);
        let bounded = fx
            .read(Query::for_key(k.clone()).with_end(t(2020, 3, 1, 9, 4)).with_limit(2, Direction::Last))
            .unwrap();
        assert_eq!(closes(&bounded), vec![3.0, 4.0]);

        let unlimited = fx.read(Query::for_key(k).with_direction(Direction::Last));
        assert!(matches!(unlimited, Err(StoreError::UnlimitedReverseScan)));
    }

    #[test]
    fn test_last_across_year_boundary_matches_first() {
        let mut fx = Fixture::new();
        let k = key("1D");
        let start = t(2019, 12, 28, 0, 0);
        let points: Vec<_> = (0..8)
            .map(|i| (start + ChronoDuration::days(i), i as f32))
            .collect();
        fx.write_fixed(&k, &points);
        assert_eq!(fx.catalog.year_files(&k).len(), 2);

        let last = fx.read(Query::for_key(k.clone()).with_limit(6, Direction::Last)).unwrap();
        let first = fx
            .read(Query::for_key(k).with_start(start + ChronoDuration::days(2)).with_limit(6, Direction::First))
            .unwrap();
        assert_eq!(closes(&last), vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(last.epochs().unwrap(), first.epochs().unwrap());
        assert_eq!(closes(&last), closes(&first));
        assert_eq!(first.previous_epoch(), Some((start + ChronoDuration::days(1)).timestamp()));
    }

    #[test]
    fn test_scan_spans_read_chunks() {
        let mut fx = Fixture::new();
        let k = key("1Min");
        let start = t(2021, 6, 1, 0, 0);
        let n = RECORDS_PER_READ + 500;
        let points: Vec<_> = (0..n)
            .map(|i| (start + ChronoDuration::minutes(i as i64), i as f32))
            .collect();
        fx.write_fixed(&k, &points);

        let all = fx.read(Query::for_key(k.clone())).unwrap();
        assert_eq!(all.len(), n);
        assert_eq!(closes(&all)[RECORDS_PER_READ], RECORDS_PER_READ as f32);
        let tail = fx.read(Query::for_key(k).with_limit(RECORDS_PER_READ + 1, Direction::Last)).unwrap();
        assert_eq!(tail.len(), RECORDS_PER_READ + 1);
        assert_eq!(closes(&tail)[0], 499.0);
    }

    #[test]
    fn test_variable_scan() {
        let mut fx = Fixture::new();
        let k = BucketKey::new("TEST", "1Min", "TICK").unwrap();
        let base = t(2020, 5, 4, 10, 0);
        let ms = ChronoDuration::milliseconds;
        fx.write_variable(
            &k,
            &[
                (base + ms(30_500), 2.0),
                (base + ms(1_250), 1.0),
                (base + ms(61_500), 3.0),
                (base + ms(125_500), 4.0),
            ],
        );

        let series = fx.read(Query::for_key(k.clone())).unwrap();
        assert_eq!(series.names(), &["Epoch", "Close", "Nanoseconds"]);
        assert_eq!(closes(&series), vec![1.0, 2.0, 3.0, 4.0]);
        let secs = base.timestamp();
        assert_eq!(series.epochs().unwrap(), &[secs + 1, secs + 30, secs + 61, secs + 125]);
        let Some(Column::Int32(nanos)) = series.column("Nanoseconds") else {
            panic!("missing Nanoseconds");
        };
        assert!((nanos[0] - 250_000_000).abs() < 1_000);
        assert!((nanos[1] - 500_000_000).abs() < 1_000);

        let ranged = fx
            .read(Query::for_key(k.clone()).with_range(base + ms(2_000), base + ms(62_000)))
            .unwrap();
        assert_eq!(closes(&ranged), vec![2.0, 3.0]);

        let last = fx.read(Query::for_key(k).with_limit(2, Direction::Last)).unwrap();
        assert_eq!(closes(&last), vec![3.0, 4.0]);
    }

    #[test]
    fn test_variable_limit_with_mid_interval_bounds() {
        let mut fx = Fixture::new();
        let k = BucketKey::new("TEST", "1Min", "TICK").unwrap();
        let base = t(2020, 5, 4, 10, 0);
        let s = ChronoDuration::seconds;
        fx.write_variable(&k, &[(base + s(10), 1.0), (base + s(70), 2.0), (base + s(130), 3.0)]);
        let secs = base.timestamp();

        let first = fx
            .read(Query::for_key(k.clone()).with_start(base + s(30)).with_limit(1, Direction::First))
            .unwrap();
        assert_eq!(closes(&first), vec![2.0]);
        assert_eq!(first.epochs().unwrap(), &[secs + 70]);

        let last = fx
            .read(Query::for_key(k.clone()).with_end(base + s(110)).with_limit(1, Direction::Last))
            .unwrap();
        assert_eq!(closes(&last), vec![2.0]);
        assert_eq!(last.epochs().unwrap(), &[secs + 70]);

        let window = fx
            .read(
                Query::for_key(k)
                    .with_range(base + s(30), base + s(140))
                    .with_limit(2, Direction::First),
            )
            .unwrap();
        assert_eq!(closes(&window), vec![2.0, 3.0]);
    }

    #[test]
    fn test_unknown_bucket() {
        let fx = Fixture::new();
        let err = fx.read(Query::for_key(key("1Min"))).unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound(_)));
    }
}
