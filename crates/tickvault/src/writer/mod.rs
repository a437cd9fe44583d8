//! Conversion of timestamped rows into write commands.
//!
//! ```text
//! (t, [epoch][columns]) ──chop epoch──> FIXED:    [columns]          one command per row
//!                                      VARIABLE: [columns][ticks]   rows of one slot batched
//!                                         │
//!                                         └──> TransactionPipe
//! ```
//!
//! Commands are only queued here; they become durable when the WAL flushes
//! the pipe.

pub mod csm;

pub use csm::{write_csm, WRITER_BUCKET_DESCRIPTION};

use crate::catalog::Catalog;
use crate::context::StorageContext;
use crate::error::{Result, StoreError};
use crate::format::timeindex::{index_to_offset, interval_ticks, time_to_index};
use crate::format::{
    aligned_size, BucketInfo, DataShape, RecordType, EPOCH_LEN, MAX_WAL_SHAPES, TICKS_LEN,
};
use crate::key::BucketKey;
use crate::txn::WriteCommand;
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::debug;

/// Queues rows for one bucket at a time.
#[derive(Debug)]
pub struct Writer<'a> {
    ctx: &'a StorageContext,
}

impl<'a> Writer<'a> {
    /// Creates a writer bound to the WAL of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveWal` if the context was opened without a WAL.
    pub fn new(ctx: &'a StorageContext) -> Result<Self> {
        if ctx.wal().is_none() {
            return Err(StoreError::NoActiveWal);
        }
        Ok(Self { ctx })
    }

    /// Queues `rows`, packed per `shapes` with the Epoch column first, for
    /// the bucket owning `info`.
    ///
    /// `times` carries the full timestamp of each row. FIXED rows are
    /// expected 8-byte aligned, VARIABLE rows unpadded. Rows crossing into a
    /// new year are routed to that year's file, which is created on demand.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the row buffer does not match `times` and
    /// the bucket layout, `BucketNotFound` if `info` belongs to no known
    /// bucket, or `TimestampOutOfRange` for years outside the file format.
    pub fn write_records(
        &self,
        times: &[DateTime<Utc>],
        rows: &[u8],
        shapes: &[DataShape],
        info: &Arc<BucketInfo>,
    ) -> Result<()> {
        if times.is_empty() {
            return Ok(());
        }
        let catalog = self.ctx.catalog();
        let key = catalog
            .owning_bucket(&info.path)
            .ok_or_else(|| StoreError::BucketNotFound(info.path.display().to_string()))?;
        if info.shapes().len() > MAX_WAL_SHAPES {
            return Err(StoreError::SchemaMismatch {
                key: key.to_string(),
                reason: format!(
                    "{} columns, write commands carry at most {MAX_WAL_SHAPES}",
                    info.shapes().len()
                ),
            });
        }
        let record_type = info.record_type();
        let row_len = input_row_len(info, shapes)?;
        if rows.len() != times.len() * row_len {
            return Err(StoreError::InvalidFormat(format!(
                "{} bytes for {} rows of {} bytes",
                rows.len(),
                times.len(),
                row_len
            )));
        }

        let mut files = YearFiles::new(catalog, &key, Arc::clone(info));
        let mut pending: Option<WriteCommand> = None;
        let mut queued = 0;
        for (t, row) in times.iter().zip(rows.chunks_exact(row_len)) {
            let info = files.for_time(t)?;
            let timeframe = info.timeframe().duration();
            let index = time_to_index(*t, timeframe);
            let offset = index_to_offset(index, info.record_length());
            let wal_key_path = key.wal_key_path(info.year);
            let payload = &row[EPOCH_LEN..];

            match record_type {
                RecordType::Fixed => {
                    self.enqueue(WriteCommand {
                        record_type,
                        wal_key_path,
                        var_rec_len: 0,
                        offset,
                        index,
                        data: payload.to_vec(),
                        shapes: info.shapes().to_vec(),
                    })?;
                    queued += 1;
                }
                RecordType::Variable => {
                    let ticks = interval_ticks(*t, index, info.intervals_per_day());
                    if let Some(cmd) = pending.as_mut() {
                        if cmd.index == index && cmd.wal_key_path == wal_key_path {
                            cmd.data.extend_from_slice(payload);
                            cmd.data.extend_from_slice(&ticks.to_le_bytes());
                            continue;
                        }
                    }
                    let mut data = Vec::with_capacity(payload.len() + TICKS_LEN);
                    data.extend_from_slice(payload);
                    data.extend_from_slice(&ticks.to_le_bytes());
                    let next = WriteCommand {
                        record_type,
                        wal_key_path,
                        var_rec_len: info.variable_record_length(),
                        offset,
                        index,
                        data,
                        shapes: info.shapes().to_vec(),
                    };
                    if let Some(cmd) = pending.replace(next) {
                        self.enqueue(cmd)?;
                        queued += 1;
                    }
                }
            }
        }
        if let Some(cmd) = pending {
            self.enqueue(cmd)?;
            queued += 1;
        }
        debug!(key = %key, rows = times.len(), commands = queued, "queued rows");
        Ok(())
    }

    fn enqueue(&self, cmd: WriteCommand) -> Result<()> {
        let pipe = self.ctx.pipe();
        if pipe.len() >= pipe.capacity() {
            self.ctx.request_flush()?;
        }
        pipe.enqueue(cmd);
        Ok(())
    }
}

/// Length of one input row: aligned for FIXED, packed for VARIABLE.
fn input_row_len(info: &BucketInfo, shapes: &[DataShape]) -> Result<usize> {
    let expected = match info.record_type() {
        RecordType::Fixed => info.record_length() as usize,
        RecordType::Variable => EPOCH_LEN + info.variable_record_length() as usize - TICKS_LEN,
    };
    let described: usize = shapes.iter().map(|s| s.ty.size()).sum();
    let described = match info.record_type() {
        RecordType::Fixed => aligned_size(described),
        RecordType::Variable => described,
    };
    if described != expected {
        return Err(StoreError::InvalidFormat(format!(
            "shapes describe {described} byte rows, bucket stores {expected}"
        )));
    }
    Ok(expected)
}

/// Year file lookup that remembers the last year used.
struct YearFiles<'a> {
    catalog: &'a Catalog,
    key: &'a BucketKey,
    current: Arc<BucketInfo>,
}

impl<'a> YearFiles<'a> {
    fn new(catalog: &'a Catalog, key: &'a BucketKey, current: Arc<BucketInfo>) -> Self {
        Self {
            catalog,
            key,
            current,
        }
    }

    fn for_time(&mut self, t: &DateTime<Utc>) -> Result<Arc<BucketInfo>> {
        let year =
            i16::try_from(t.year()).map_err(|_| StoreError::TimestampOutOfRange(t.timestamp()))?;
        if year != self.current.year {
            self.current = self.catalog.add_year_file(self.key, year)?;
        }
        Ok(Arc::clone(&self.current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::format::{ElementType, Timeframe, HEADER_SIZE};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn create_test_context(temp_dir: &TempDir) -> StorageContext {
        let config = StorageConfig::new(temp_dir.path()).with_background_flusher(false);
        StorageContext::open(config).unwrap()
    }

    fn create_test_bucket(ctx: &StorageContext, record_type: RecordType) -> Arc<BucketInfo> {
        let key = BucketKey::new("TEST", "1Min", "TICK").unwrap();
        let info = BucketInfo::new(
            "",
            "writer test",
            2020,
            Timeframe::parse("1Min").unwrap(),
            vec![DataShape::new("Close", ElementType::Float32)],
            record_type,
        );
        ctx.catalog().add_time_bucket(&key, info).unwrap()
    }

    fn shapes() -> Vec<DataShape> {
        vec![
            DataShape::new("Epoch", ElementType::Int64),
            DataShape::new("Close", ElementType::Float32),
        ]
    }

    fn row(t: DateTime<Utc>, close: f32, aligned: bool) -> Vec<u8> {
        let mut row = t.timestamp().to_le_bytes().to_vec();
        row.extend_from_slice(&close.to_le_bytes());
        if aligned {
            row.resize(16, 0);
        }
        row
    }

    #[test]
    fn test_read_only_context_has_no_writer() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::new(temp_dir.path()).with_read_only(true);
        let ctx = StorageContext::open(config).unwrap();
        assert!(matches!(Writer::new(&ctx), Err(StoreError::NoActiveWal)));
    }

    #[test]
    fn test_fixed_rows_cross_year() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = create_test_context(&temp_dir);
        let info = create_test_bucket(&ctx, RecordType::Fixed);
        let times = [
            Utc.with_ymd_and_hms(2020, 12, 31, 23, 59, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
        ];
        let rows = [row(times[0], 1.0, true), row(times[1], 2.0, true)].concat();

        Writer::new(&ctx).unwrap().write_records(&times, &rows, &shapes(), &info).unwrap();
        let queued = ctx.pipe().drain(10);
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].wal_key_path, "TEST/1Min/TICK/2020.bin");
        assert_eq!(queued[1].wal_key_path, "TEST/1Min/TICK/2021.bin");
        assert_eq!(queued[1].offset, HEADER_SIZE);
        assert_eq!(queued[1].index, 1);
        assert_eq!(queued[0].data.len(), 8);
        let key = BucketKey::new("TEST", "1Min", "TICK").unwrap();
        assert_eq!(ctx.catalog().year_files(&key).len(), 2);
    }

    #[test]
    fn test_variable_rows_batch_per_slot() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = create_test_context(&temp_dir);
        let info = create_test_bucket(&ctx, RecordType::Variable);
        let base = Utc.with_ymd_and_hms(2020, 6, 1, 9, 30, 0).unwrap();
        let times = [
            base + chrono::Duration::seconds(1),
            base + chrono::Duration::seconds(20),
            base + chrono::Duration::seconds(70),
        ];
        let rows: Vec<u8> = times.iter().flat_map(|t| row(*t, 1.5, false)).collect();

        Writer::new(&ctx).unwrap().write_records(&times, &rows, &shapes(), &info).unwrap();
        let queued = ctx.pipe().drain(10);
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].data.len(), 16);
        assert_eq!(queued[0].var_rec_len, 8);
        assert_eq!(queued[1].index, queued[0].index + 1);
    }

    #[test]
    fn test_too_many_columns_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = create_test_context(&temp_dir);
        let key = BucketKey::new("WIDE", "1Min", "BOOK").unwrap();
        let columns: Vec<DataShape> = (0..=MAX_WAL_SHAPES)
            .map(|i| DataShape::new(format!("L{i}"), ElementType::Byte))
            .collect();
        let info = BucketInfo::new(
            "",
            "wide",
            2020,
            Timeframe::parse("1Min").unwrap(),
            columns.clone(),
            RecordType::Fixed,
        );
        let info = ctx.catalog().add_time_bucket(&key, info).unwrap();

        let mut shapes = vec![DataShape::new("Epoch", ElementType::Int64)];
        shapes.extend(columns);
        let t = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let mut row = t.timestamp().to_le_bytes().to_vec();
        row.resize(info.record_length() as usize, 1);

        let err = Writer::new(&ctx).unwrap().write_records(&[t], &row, &shapes, &info).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }), "{err}");
        assert!(ctx.pipe().is_empty());
    }

    #[test]
    fn test_row_length_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = create_test_context(&temp_dir);
        let info = create_test_bucket(&ctx, RecordType::Fixed);
        let t = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let err = Writer::new(&ctx)
            .unwrap()
            .write_records(&[t], &row(t, 1.0, false), &shapes(), &info)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFormat(_)));
    }
}
