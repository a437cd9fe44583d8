//! Per-file read hints.
//!
//! A hint is the largest byte offset of a live slot known for a year file.
//! Scans stop reading there instead of walking empty slots to the end of
//! the year. A hint is only created by a backward scan that reached the end
//! of the file. Hints only move forward, and primary writes raise existing
//! hints but never create one: a write does not know where the last live
//! slot of the file is.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Shared map from year-file path to the offset of its last live slot.
#[derive(Debug, Default)]
pub struct ReadHints {
    offsets: RwLock<HashMap<PathBuf, i64>>,
}

impl ReadHints {
    /// Creates an empty hint cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hinted offset of the last live slot of `path`, if known.
    pub fn get(&self, path: &Path) -> Option<i64> {
        self.offsets.read().get(path).copied()
    }

    /// Raises the hint for `path` to at least `offset`.
    pub fn raise(&self, path: &Path, offset: i64) {
        if self.get(path).is_some_and(|current| current >= offset) {
            return;
        }
        let mut offsets = self.offsets.write();
        let entry = offsets.entry(path.to_path_buf()).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }

    /// Raises the hint for `path` to at least `offset`, but only if a hint
    /// is already known for it.
    pub fn raise_if_present(&self, path: &Path, offset: i64) {
        if let Some(current) = self.offsets.write().get_mut(path) {
            if *current < offset {
                *current = offset;
            }
        }
    }

    /// Drops the hint for `path`.
    pub fn forget(&self, path: &Path) {
        self.offsets.write().remove(path);
    }
}
