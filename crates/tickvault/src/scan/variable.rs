//! Second read stage of VARIABLE buckets.
//!
//! The first stage yields indirect slots whose index word already holds the
//! interval start. Each slot is expanded into its row group and every row
//! is rewritten from `[data][ticks u32]` to `[epoch i64][data][nanos i32]`.

use super::plan::IoPlan;
use super::Direction;
use super::exec::read_range;
use crate::error::{Result, StoreError};
use crate::format::timeindex::time_from_ticks;
use crate::format::{INDIRECT_RECORD_LEN, TICKS_LEN};
use crate::wal::primary::{decompress, IndirectRecord};
use chrono::{DateTime, Utc};
use std::fs::File;

/// Bytes an output row gains over a stored row: the epoch word replaces
/// nothing and the nanoseconds word replaces the ticks.
pub(crate) const EXTRA_ROW_LEN: usize = 8;

pub(crate) fn read_second_stage(
    plan: &IoPlan,
    segments: &[(usize, Vec<u8>)],
    compressed: bool,
) -> Result<Vec<u8>> {
    let stored_len = plan.variable_record_length as usize;
    if stored_len < TICKS_LEN {
        return Err(StoreError::InvalidFormat(format!(
            "variable record length {stored_len}"
        )));
    }
    let data_len = stored_len - TICKS_LEN;
    let mut out = Vec::new();

    for (file_idx, slots) in segments {
        if slots.is_empty() {
            continue;
        }
        let file = &plan.files[*file_idx];
        let mut fd = File::open(&file.path)?;
        for slot in slots.chunks_exact(INDIRECT_RECORD_LEN) {
            let rec = IndirectRecord::from_bytes(slot);
            let len = usize::try_from(rec.len).map_err(|_| {
                StoreError::InvalidFormat(format!("negative row group length {}", rec.len))
            })?;
            let raw = read_range(&mut fd, rec.offset, len)?;
            if raw.len() != len {
                return Err(StoreError::ShortRead {
                    expected: len,
                    actual: raw.len(),
                });
            }
            let rows = decompress(&raw, compressed)?;
            for row in rows.chunks_exact(stored_len) {
                let ticks = u32::from_le_bytes(row[data_len..].try_into().unwrap());
                let (secs, nanos) = time_from_ticks(rec.index, file.intervals_per_day, ticks);
                out.extend_from_slice(&secs.to_le_bytes());
                out.extend_from_slice(&row[..data_len]);
                out.extend_from_slice(&(nanos as i32).to_le_bytes());
            }
        }
    }
    Ok(out)
}

fn row_time(row: &[u8]) -> (i64, i32) {
    let secs = i64::from_le_bytes(row[..8].try_into().unwrap());
    let nanos = i32::from_le_bytes(row[row.len() - 4..].try_into().unwrap());
    (secs, nanos)
}

fn split(t: DateTime<Utc>) -> (i64, i32) {
    (t.timestamp(), t.timestamp_subsec_nanos() as i32)
}

/// Keeps rows whose full timestamp lies within `start..=end`.
pub(crate) fn trim_to_range(
    rows: Vec<u8>,
    row_len: usize,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<u8> {
    if start.is_none() && end.is_none() {
        return rows;
    }
    let start = start.map(split);
    let end = end.map(split);
    rows.chunks_exact(row_len)
        .filter(|row| {
            let t = row_time(row);
            start.map_or(true, |s| t >= s) && end.map_or(true, |e| t <= e)
        })
        .flatten()
        .copied()
        .collect()
}

/// Keeps the first or last `limit` rows.
pub(crate) fn trim_to_limit(
    mut rows: Vec<u8>,
    row_len: usize,
    limit: Option<usize>,
    direction: Direction,
) -> Vec<u8> {
    let Some(limit) = limit else {
        return rows;
    };
    let count = rows.len() / row_len;
    if count <= limit {
        return rows;
    }
    match direction {
        Direction::First => {
            rows.truncate(limit * row_len);
            rows
        }
        Direction::Last => rows.split_off((count - limit) * row_len),
    }
}
