//! Per-process storage state.
//!
//! A [`StorageContext`] owns everything one running instance needs: the
//! catalog, the transaction pipe, the active WAL file and its flusher. It is
//! handed by reference to writers, readers and the deleter.
//!
//! ```text
//! open(config)
//!   ├─ catalog discovery
//!   ├─ create WAL file (owned by this instance)
//!   ├─ replay + delete orphaned WAL files
//!   └─ start flusher
//! ```

use crate::catalog::Catalog;
use crate::columns::ColumnSeriesMap;
use crate::config::StorageConfig;
use crate::delete::Deleter;
use crate::error::{Result, StoreError};
use crate::scan::{Query, ReadHints, Reader};
use crate::trigger::{Dispatcher, TriggerMatcher};
use crate::txn::TransactionPipe;
use crate::wal::{list_wal_files, Flusher, ReplicationSender, WalCleaner, WalFile, WalShared};
use crate::writer;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state of one storage instance.
#[derive(Debug)]
pub struct StorageContext {
    config: StorageConfig,
    instance_id: i64,
    catalog: Arc<Catalog>,
    hints: Arc<ReadHints>,
    pipe: Arc<TransactionPipe>,
    triggers: Arc<Dispatcher>,
    wal: Option<Arc<Mutex<WalFile>>>,
    flusher: RwLock<Option<Flusher>>,
    closed: AtomicBool,
}

impl StorageContext {
    /// Opens the storage below `config.root_directory` without triggers or
    /// replication.
    ///
    /// # Errors
    ///
    /// See [`StorageContext::open_with`].
    pub fn open(config: StorageConfig) -> Result<Self> {
        Self::open_with(config, Vec::new(), None)
    }

    /// Opens the storage, replays WAL files left by earlier instances and
    /// starts the flusher.
    ///
    /// Read-only contexts skip the WAL entirely.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings, an error if the catalog cannot
    /// be loaded, or an error from WAL creation or orphan cleanup.
    pub fn open_with(
        config: StorageConfig,
        triggers: Vec<TriggerMatcher>,
        replication: Option<Arc<dyn ReplicationSender>>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root_directory)?;
        let instance_id = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let catalog = Arc::new(Catalog::open(&config.root_directory)?);
        let hints = Arc::new(ReadHints::new());
        let pipe = Arc::new(TransactionPipe::new(config.queue_capacity));
        let triggers = Arc::new(Dispatcher::new(triggers));

        let mut ctx = Self {
            config,
            instance_id,
            catalog,
            hints,
            pipe,
            triggers,
            wal: None,
            flusher: RwLock::new(None),
            closed: AtomicBool::new(false),
        };
        if ctx.config.read_only {
            info!(root = ?ctx.config.root_directory, "opened read-only storage");
            return Ok(ctx);
        }

        let mut shared = WalShared::new(
            Arc::clone(&ctx.catalog),
            Arc::clone(&ctx.pipe),
            Arc::clone(&ctx.hints),
            Arc::clone(&ctx.triggers),
        );
        if let Some(sender) = replication {
            shared = shared.with_replication(sender);
        }
        let wal = WalFile::create(&ctx.config, instance_id, shared.clone())?;
        if let Err(e) = ctx.cleanup_orphans(&wal, &shared) {
            let path = wal.path().to_path_buf();
            drop(wal);
            if let Err(remove) = fs::remove_file(&path) {
                warn!(path = ?path, error = %remove, "failed to remove unused WAL file");
            }
            return Err(e);
        }

        let wal = Arc::new(Mutex::new(wal));
        if ctx.config.background_flusher {
            let flusher = Flusher::start(
                Arc::clone(&wal),
                ctx.config.wal_flush_interval,
                ctx.config.primary_flush_interval,
            )?;
            *ctx.flusher.get_mut() = Some(flusher);
        }
        ctx.wal = Some(wal);
        info!(root = ?ctx.config.root_directory, instance_id, "opened storage");
        Ok(ctx)
    }

    /// Replays and deletes every WAL file except the active one.
    fn cleanup_orphans(&self, active: &WalFile, shared: &WalShared) -> Result<usize> {
        let paths = list_wal_files(&self.config.root_directory)?;
        let cleaner = WalCleaner::new(Some(active.path().to_path_buf()), self.instance_id);
        let cleaned = cleaner.cleanup(&paths, &self.config, shared)?;
        if cleaned > 0 {
            info!(cleaned, "replayed orphaned WAL files");
        }
        Ok(cleaned)
    }

    /// Configuration the context was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// ID of this instance, the owner recorded in the WAL STATUS.
    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    /// Bucket catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Read hints shared by the WAL and readers.
    pub fn hints(&self) -> &Arc<ReadHints> {
        &self.hints
    }

    /// Transaction pipe feeding the WAL.
    pub fn pipe(&self) -> &Arc<TransactionPipe> {
        &self.pipe
    }

    /// Active WAL file; `None` for read-only contexts.
    pub fn wal(&self) -> Option<&Arc<Mutex<WalFile>>> {
        self.wal.as_ref()
    }

    /// Flushes everything queued so far to the WAL and the primary files.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveWal` for read-only contexts, or the flush error.
    pub fn request_flush(&self) -> Result<()> {
        let wal = self.wal.as_ref().ok_or(StoreError::NoActiveWal)?;
        if let Some(flusher) = self.flusher.read().as_ref().filter(|f| f.is_running()) {
            return flusher.request_flush();
        }
        wal.lock().flush_to_wal()
    }

    /// Flushes, then makes the primary files durable.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveWal` for read-only contexts, or the flush or
    /// checkpoint error.
    pub fn checkpoint(&self) -> Result<()> {
        self.request_flush()?;
        let wal = self.wal.as_ref().ok_or(StoreError::NoActiveWal)?;
        wal.lock().create_checkpoint()
    }

    /// Writes column series; see [`writer::write_csm`].
    ///
    /// # Errors
    ///
    /// See [`writer::write_csm`].
    pub fn write_csm(&self, csm: &ColumnSeriesMap, is_variable: bool) -> Result<()> {
        writer::write_csm(self, csm, is_variable)
    }

    /// Runs `query`.
    ///
    /// # Errors
    ///
    /// See [`Reader::new`] and [`Reader::read`].
    pub fn read(&self, query: Query) -> Result<ColumnSeriesMap> {
        Reader::new(self, query)?.read()
    }

    /// Deletes the range of `query` after flushing pending writes. Returns
    /// the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveWal` for read-only contexts, `BucketNotFound` for
    /// unknown buckets, or an I/O error.
    pub fn delete(&self, query: &Query) -> Result<usize> {
        self.request_flush()?;
        let wal = self.wal.as_ref().ok_or(StoreError::NoActiveWal)?;
        // Primary files have one writer at a time.
        let _guard = wal.lock();
        Deleter::new(&self.catalog, &self.hints, query)?.delete()
    }

    /// Flushes and checkpoints one last time, stops the flusher and waits for
    /// running triggers. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the error of the final flush or checkpoint.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = match self.flusher.write().take() {
            Some(mut flusher) => flusher.shutdown(),
            None => match &self.wal {
                Some(wal) => {
                    let mut wal = wal.lock();
                    wal.flush_to_wal().and_then(|()| wal.create_checkpoint())
                }
                None => Ok(()),
            },
        };
        self.triggers.finish_and_wait();
        info!(instance_id = self.instance_id, "storage shut down");
        result
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to shut down storage on drop");
        }
    }
}
