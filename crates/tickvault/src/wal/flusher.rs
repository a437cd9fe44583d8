//! Background thread driving WAL flushes and primary checkpoints.
//!
//! ```text
//!            ┌── every wal_flush_interval ───────> flush_to_wal
//! flusher ───┼── every wal_flush_interval/100 ──> flush_to_wal if queue ≥ 80%
//!            ├── every primary_flush_interval ──> checkpoint (+ rotate)
//!            └── request_flush / shutdown ──────> flush_to_wal (+ checkpoint)
//! ```
//!
//! Synchronous flush requests coalesce: every requester that registers
//! before the thread picks up the pending request is answered by the same
//! flush.

use super::WalFile;
use crate::error::{Result, StoreError};
use crate::txn::TransactionPipe;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Lower bound of the queue-depth check period.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

type Reply = std::result::Result<(), String>;
type Waiters = Arc<Mutex<Vec<Sender<Reply>>>>;

enum Signal {
    Flush,
    Shutdown,
}

/// Handle to the flusher thread.
#[derive(Debug)]
pub struct Flusher {
    signals: Sender<Signal>,
    waiters: Waiters,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    /// Starts the flusher thread for `wal`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(
        wal: Arc<Mutex<WalFile>>,
        wal_interval: Duration,
        primary_interval: Duration,
    ) -> Result<Self> {
        let (signals, rx) = mpsc::channel();
        let waiters: Waiters = Arc::new(Mutex::new(Vec::new()));
        let pipe = Arc::clone(&wal.lock().shared().pipe);
        let worker = Worker {
            wal,
            pipe,
            waiters: Arc::clone(&waiters),
            wal_interval,
            primary_interval,
            check_interval: (wal_interval / 100).max(MIN_CHECK_INTERVAL),
        };
        let handle = thread::Builder::new()
            .name("tickvault-flusher".into())
            .spawn(move || worker.run(rx))?;
        debug!(?wal_interval, ?primary_interval, "started WAL flusher");
        Ok(Self {
            signals,
            waiters,
            handle: Some(handle),
        })
    }

    /// Returns true until [`Flusher::shutdown`] has run.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Asks the thread to flush and waits until a flush covering everything
    /// queued before this call has finished.
    ///
    /// # Errors
    ///
    /// Returns `FlushFailed` if the thread is gone or the flush failed.
    pub fn request_flush(&self) -> Result<()> {
        if !self.is_running() {
            return Err(StoreError::FlushFailed("flusher is not running".into()));
        }
        let (tx, rx) = mpsc::channel();
        let first = {
            let mut waiters = self.waiters.lock();
            waiters.push(tx);
            waiters.len() == 1
        };
        if first && self.signals.send(Signal::Flush).is_err() {
            self.waiters.lock().clear();
            return Err(StoreError::FlushFailed("flusher is not running".into()));
        }
        rx.recv()
            .map_err(|_| StoreError::FlushFailed("flusher stopped before flushing".into()))?
            .map_err(StoreError::FlushFailed)
    }

    /// Flushes and checkpoints one last time, then stops the thread.
    ///
    /// # Errors
    ///
    /// Returns `FlushFailed` if the thread panicked.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.signals.send(Signal::Shutdown);
        handle
            .join()
            .map_err(|_| StoreError::FlushFailed("flusher thread panicked".into()))?;
        debug!("stopped WAL flusher");
        Ok(())
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "failed to stop WAL flusher on drop");
        }
    }
}

struct Worker {
    wal: Arc<Mutex<WalFile>>,
    pipe: Arc<TransactionPipe>,
    waiters: Waiters,
    wal_interval: Duration,
    primary_interval: Duration,
    check_interval: Duration,
}

impl Worker {
    fn run(self, rx: Receiver<Signal>) {
        let start = Instant::now();
        let mut next_wal = start + self.wal_interval;
        let mut next_check = start + self.check_interval;
        let mut next_primary = start + self.primary_interval;

        loop {
            let deadline = next_wal.min(next_check).min(next_primary);
            let timeout = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(Signal::Flush) => self.flush(),
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush();
                    self.checkpoint();
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            if now >= next_check {
                if self.pipe.should_flush() {
                    debug!(queued = self.pipe.len(), "queue threshold reached, flushing");
                    self.flush();
                }
                next_check = now + self.check_interval;
            }
            if now >= next_wal {
                self.flush();
                next_wal = now + self.wal_interval;
            }
            if now >= next_primary {
                self.checkpoint();
                next_primary = now + self.primary_interval;
            }
        }
    }

    fn flush(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        // Commit failures abort inside flush_to_wal; what comes back here
        // was refused before anything was drained.
        let result = self.wal.lock().flush_to_wal().map_err(|e| {
            error!(error = %e, "WAL flush refused");
            e.to_string()
        });
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn checkpoint(&self) {
        if let Err(e) = self.wal.lock().primary_cycle() {
            error!(error = %e, "primary checkpoint failed, durability state unknown");
            std::process::abort();
        }
    }
}
