//! Startup recovery of WAL files left behind by earlier instances.

use super::message::STATUS_PAYLOAD_LEN;
use super::{WalFile, WalShared};
use crate::config::StorageConfig;
use crate::error::{Result, StoreError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Suffix appended to WAL files that could not be replayed.
pub const MOVED_ASIDE_SUFFIX: &str = "tmp";

/// Replays and removes orphaned WAL files.
#[derive(Debug, Clone)]
pub struct WalCleaner {
    ignore: Option<PathBuf>,
    instance_id: i64,
}

impl WalCleaner {
    /// Creates a cleaner running as `instance_id` that leaves `ignore`, the
    /// active WAL file, alone.
    pub fn new(ignore: Option<PathBuf>, instance_id: i64) -> Self {
        Self {
            ignore,
            instance_id,
        }
    }

    /// Replays every file in `paths` and deletes it afterwards.
    ///
    /// Files holding nothing but a STATUS payload are removed outright. Files
    /// whose replay fails with a continuable error are renamed to
    /// `<name>.tmp` and kept for inspection. Returns the number of files
    /// replayed and deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be taken over, fails to replay in a
    /// way that is not a replay error, or cannot be deleted.
    pub fn cleanup(
        &self,
        paths: &[PathBuf],
        config: &StorageConfig,
        shared: &WalShared,
    ) -> Result<usize> {
        let mut cleaned = 0;
        for path in paths {
            if self.ignore.as_deref() == Some(path.as_path()) {
                continue;
            }
            info!(path = ?path, "found WAL file, entering replay");
            let len = match fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    error!(path = ?path, error = %e, "failed to stat WAL file");
                    continue;
                }
            };
            if len <= STATUS_PAYLOAD_LEN {
                info!(path = ?path, "removing empty WAL file");
                if let Err(e) = fs::remove_file(path) {
                    error!(path = ?path, error = %e, "failed to remove empty WAL file");
                }
                continue;
            }

            let mut wal = WalFile::take_over(path, config, self.instance_id, shared.clone())?;
            match wal.replay(false) {
                Ok(_) => {}
                Err(e @ StoreError::Replay { cont: true, .. }) => {
                    let aside = moved_aside_path(path);
                    drop(wal);
                    fs::rename(path, &aside)?;
                    warn!(path = ?path, moved_to = ?aside, error = %e, "unable to replay, moved WAL file aside");
                    continue;
                }
                Err(e @ StoreError::Replay { .. }) => {
                    warn!(path = ?path, error = %e, "unable to replay WAL file");
                    continue;
                }
                Err(e) => return Err(e),
            }
            wal.delete(self.instance_id)?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

fn moved_aside_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(MOVED_ASIDE_SUFFIX);
    PathBuf::from(name)
}
