//! In-place deletion of a time range.
//!
//! Every live slot inside the range is overwritten with zeros, which turns
//! it into a hole. Slots that already are holes are left untouched, so runs
//! of live slots are zeroed with one write each:
//!
//! ```text
//! before: [live][hole][live][live][hole]
//! after:  [0000][hole][0000][0000][hole]
//!          ^write      ^--write--^
//! ```
//!
//! VARIABLE payload extents are not reclaimed; only their pointer slots are
//! cleared.

use crate::catalog::Catalog;
use crate::error::{Result, StoreError};
use crate::scan::exec::read_range;
use crate::scan::plan::IoPlan;
use crate::scan::{Query, ReadHints, RECORDS_PER_READ};
use crate::format::EPOCH_LEN;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, error};

/// Zeroes the live slots of the buckets and range named by a [`Query`].
///
/// Row limits and directions of the query are ignored.
#[derive(Debug)]
pub struct Deleter {
    plans: Vec<IoPlan>,
}

impl Deleter {
    /// Plans the deletion against `catalog`.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` for unknown buckets and
    /// `RecordLengthNotConsistent` if the year files of a bucket disagree.
    pub fn new(catalog: &Catalog, hints: &Arc<ReadHints>, query: &Query) -> Result<Self> {
        let plans = query
            .keys()
            .iter()
            .map(|key| {
                let files = catalog.year_files(key);
                if files.is_empty() {
                    return Err(StoreError::BucketNotFound(key.to_string()));
                }
                IoPlan::new(key.clone(), &files, query, hints)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { plans })
    }

    /// Runs the deletion and returns the number of slots cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if a year file cannot be opened, read or written.
    pub fn delete(&self) -> Result<usize> {
        let mut cleared = 0;
        for plan in &self.plans {
            let n = delete_plan(plan)?;
            debug!(key = %plan.key, cleared = n, "deleted range");
            cleared += n;
        }
        Ok(cleared)
    }
}

fn delete_plan(plan: &IoPlan) -> Result<usize> {
    let record_len = plan.record_length as usize;
    let zero = vec![0u8; record_len * RECORDS_PER_READ];
    let mut cleared = 0;
    for file in &plan.files {
        let mut fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file.path)
            .inspect_err(|e| error!(path = ?file.path, error = %e, "failed to open for delete"))?;

        let total = file.length as usize / record_len;
        let mut first = 0;
        while first < total {
            let count = RECORDS_PER_READ.min(total - first);
            let offset = file.offset + (first * record_len) as i64;
            let chunk = read_range(&mut fd, offset, count * record_len)?;
            cleared += zero_live_runs(&mut fd, &chunk, offset, record_len, &zero)?;
            if chunk.len() < count * record_len {
                break;
            }
            first += count;
        }
    }
    Ok(cleared)
}

/// Zeroes every run of live slots in `chunk`, read from `offset`. Returns the
/// number of slots cleared.
fn zero_live_runs(
    fd: &mut File,
    chunk: &[u8],
    offset: i64,
    record_len: usize,
    zero: &[u8],
) -> Result<usize> {
    let mut cleared = 0;
    let mut run_start: Option<usize> = None;
    let slots = chunk.chunks_exact(record_len);
    let count = slots.len();
    for (i, slot) in slots.enumerate() {
        let live = slot[..EPOCH_LEN] != [0u8; EPOCH_LEN];
        if live {
            run_start.get_or_insert(i);
            cleared += 1;
        }
        let end_of_run = !live || i + 1 == count;
        if let (true, Some(start)) = (end_of_run, run_start) {
            let end = if live { i + 1 } else { i };
            fd.seek(SeekFrom::Start((offset as usize + start * record_len) as u64))?;
            fd.write_all(&zero[..(end - start) * record_len])?;
            run_start = None;
        }
    }
    Ok(cleared)
}
