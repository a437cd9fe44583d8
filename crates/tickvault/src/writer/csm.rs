//! Writing column series maps.
//!
//! Each incoming series is reconciled with the on-disk shape of its bucket
//! before it reaches the [`Writer`](super::Writer):
//!
//! - the `Epoch` column is mandatory,
//! - bucket columns absent from the input are filled with zeros,
//! - input columns unknown to the bucket are rejected,
//! - remaining columns are coerced to the stored element type.
//!
//! Buckets that do not exist yet are created from the shape of the input.

use super::Writer;
use crate::columns::{Column, ColumnSeries, ColumnSeriesMap};
use crate::context::StorageContext;
use crate::error::{Result, StoreError};
use crate::format::timeindex::epoch_to_time;
use crate::format::{BucketInfo, DataShape, ElementType, RecordType, EPOCH_COLUMN, NANOSECONDS_COLUMN};
use crate::key::BucketKey;
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Description stored in the header of buckets created on first write.
pub const WRITER_BUCKET_DESCRIPTION: &str = "Created By Writer";

/// Writes every series of `csm` and requests a flush.
///
/// With `is_variable` set, new buckets are created VARIABLE and an optional
/// `Nanoseconds` column supplies the sub-second part of each timestamp.
///
/// # Errors
///
/// Returns `MissingColumn` without an Epoch column, `SchemaMismatch` for
/// columns or record types the bucket does not have, `UnsupportedCoercion`
/// for impossible type conversions, `NoActiveWal` for read-only contexts,
/// or the error of the flush.
pub fn write_csm(ctx: &StorageContext, csm: &ColumnSeriesMap, is_variable: bool) -> Result<()> {
    let writer = Writer::new(ctx)?;
    for (key, series) in csm {
        if series.is_empty() {
            continue;
        }
        write_series(ctx, &writer, key, series.clone(), is_variable)?;
    }
    ctx.request_flush()
}

fn write_series(
    ctx: &StorageContext,
    writer: &Writer<'_>,
    key: &BucketKey,
    mut series: ColumnSeries,
    is_variable: bool,
) -> Result<()> {
    let nanos = if is_variable {
        series
            .remove(NANOSECONDS_COLUMN)
            .map(|c| c.coerce(NANOSECONDS_COLUMN, ElementType::Int32))
            .transpose()?
    } else {
        None
    };
    let epochs = match series.column(EPOCH_COLUMN) {
        Some(column) => column.coerce(EPOCH_COLUMN, ElementType::Int64)?,
        None => {
            return Err(StoreError::MissingColumn {
                key: key.to_string(),
                column: EPOCH_COLUMN.to_string(),
            })
        }
    };
    let times = row_times(&epochs, nanos.as_ref());
    series.coerce_column(EPOCH_COLUMN, ElementType::Int64)?;

    let info = bucket_for(ctx, key, &series, &times, is_variable)?;
    let expected = if is_variable {
        RecordType::Variable
    } else {
        RecordType::Fixed
    };
    if info.record_type() != expected {
        return Err(StoreError::SchemaMismatch {
            key: key.to_string(),
            reason: format!("bucket is {:?}, write is {:?}", info.record_type(), expected),
        });
    }

    reconcile(key, &mut series, info.shapes())?;
    let mut shapes = Vec::with_capacity(info.shapes().len() + 1);
    shapes.push(DataShape::new(EPOCH_COLUMN, ElementType::Int64));
    shapes.extend(info.shapes().iter().cloned());
    let rows = series.to_rows(&shapes, !is_variable)?;

    writer.write_records(&times, &rows, &shapes, &info)?;
    debug!(key = %key, rows = times.len(), "wrote column series");
    Ok(())
}

fn row_times(epochs: &Column, nanos: Option<&Column>) -> Vec<DateTime<Utc>> {
    let Column::Int64(secs) = epochs else {
        return Vec::new();
    };
    let nanos = match nanos {
        Some(Column::Int32(v)) => v.as_slice(),
        _ => &[],
    };
    secs.iter()
        .enumerate()
        .map(|(i, s)| {
            let ns = nanos.get(i).copied().unwrap_or(0);
            epoch_to_time(*s, u32::try_from(ns).unwrap_or(0))
        })
        .collect()
}

fn bucket_for(
    ctx: &StorageContext,
    key: &BucketKey,
    series: &ColumnSeries,
    times: &[DateTime<Utc>],
    is_variable: bool,
) -> Result<Arc<BucketInfo>> {
    let catalog = ctx.catalog();
    if catalog.contains(key) {
        return catalog.latest_bucket_info(key);
    }
    let first = times.first().ok_or_else(|| StoreError::MissingColumn {
        key: key.to_string(),
        column: EPOCH_COLUMN.to_string(),
    })?;
    let year =
        i16::try_from(first.year()).map_err(|_| StoreError::TimestampOutOfRange(first.timestamp()))?;
    let record_type = if is_variable {
        RecordType::Variable
    } else {
        RecordType::Fixed
    };
    let info = BucketInfo::new(
        "",
        WRITER_BUCKET_DESCRIPTION,
        year,
        key.timeframe()?,
        series.shapes(),
        record_type,
    );
    info!(key = %key, year, ?record_type, "creating bucket on write");
    catalog.add_time_bucket(key, info)
}

/// Brings `series` in line with the bucket columns `shapes`.
fn reconcile(key: &BucketKey, series: &mut ColumnSeries, shapes: &[DataShape]) -> Result<()> {
    if let Some(unknown) = series
        .names()
        .iter()
        .find(|name| *name != EPOCH_COLUMN && !shapes.iter().any(|s| &s.name == *name))
    {
        return Err(StoreError::SchemaMismatch {
            key: key.to_string(),
            reason: format!("column {unknown} is not part of the bucket"),
        });
    }
    let rows = series.len();
    for shape in shapes {
        if series.column(&shape.name).is_none() {
            let zeros = Column::zeroed(shape.ty, rows).ok_or_else(|| StoreError::SchemaMismatch {
                key: key.to_string(),
                reason: format!("column {} has no storable type", shape.name),
            })?;
            series.add_column(shape.name.clone(), zeros);
            continue;
        }
        series.coerce_column(&shape.name, shape.ty)?;
    }
    Ok(())
}
