//! Post-write notifications.
//!
//! After a transaction group reaches the primary files, the records it wrote
//! are grouped per WAL key path and handed to a dispatcher thread. Each
//! matching [`Trigger`] runs on its own thread so a slow or failing trigger
//! never holds up the flusher.
//!
//! ```text
//! flush ──append_record──> pending ──dispatch──> [dispatcher] ──spawn──> trigger.fire()
//! ```

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// One written slot: its interval index and the payload stored for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Interval index of the slot.
    pub index: i64,
    /// Row payload without the index word. For VARIABLE buckets this holds
    /// every row of the group written in this transaction.
    pub payload: Vec<u8>,
}

impl Record {
    /// Creates a record.
    pub fn new(index: i64, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }
}

/// A callback fired with the records written to one year file.
pub trait Trigger: Send + Sync {
    /// Handles records written to `key_path` (`SYMBOL/TF/GROUP/YYYY.bin`).
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatcher and otherwise ignored.
    fn fire(&self, key_path: &str, records: &[Record]) -> Result<()>;
}

/// Binds a trigger to a key path pattern.
///
/// The pattern is matched segment by segment against the leading segments of
/// the key path; `*` matches exactly one segment. `*/1Min/OHLCV` matches
/// `AAPL/1Min/OHLCV/2020.bin` but not `AAPL/5Min/OHLCV/2020.bin`.
#[derive(Clone)]
pub struct TriggerMatcher {
    on: String,
    trigger: Arc<dyn Trigger>,
}

impl std::fmt::Debug for TriggerMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerMatcher").field("on", &self.on).finish()
    }
}

impl TriggerMatcher {
    /// Creates a matcher firing `trigger` for key paths matching `on`.
    pub fn new(on: impl Into<String>, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            on: on.into(),
            trigger,
        }
    }

    /// The pattern.
    pub fn on(&self) -> &str {
        &self.on
    }

    /// Returns true if `key_path` matches the pattern.
    pub fn matches(&self, key_path: &str) -> bool {
        let mut segments = key_path.split('/');
        self.on.split('/').all(|pattern| match segments.next() {
            Some(segment) if pattern == "*" => !segment.is_empty(),
            Some(segment) => pattern == segment,
            None => false,
        })
    }
}

struct Batch {
    key_path: String,
    records: Arc<Vec<Record>>,
}

/// Collects written records during a flush and fires matching triggers.
pub struct Dispatcher {
    matchers: Arc<Vec<TriggerMatcher>>,
    pending: Mutex<BTreeMap<String, Vec<Record>>>,
    sender: Mutex<Option<Sender<Batch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Starts a dispatcher for `matchers`. With no matchers nothing is
    /// collected and no thread is started.
    pub fn new(matchers: Vec<TriggerMatcher>) -> Self {
        let matchers = Arc::new(matchers);
        let (sender, worker) = if matchers.is_empty() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel();
            let worker_matchers = Arc::clone(&matchers);
            let handle = thread::Builder::new()
                .name("tickvault-triggers".into())
                .spawn(move || run(&worker_matchers, rx));
            match handle {
                Ok(handle) => (Some(tx), Some(handle)),
                Err(e) => {
                    error!(error = %e, "failed to start trigger dispatcher");
                    (None, None)
                }
            }
        };
        Self {
            matchers,
            pending: Mutex::new(BTreeMap::new()),
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
        }
    }

    /// Returns true if any trigger is registered.
    pub fn is_enabled(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Collects a written record for the next dispatch.
    pub fn append_record(&self, key_path: &str, record: Record) {
        if !self.is_enabled() {
            return;
        }
        self.pending
            .lock()
            .entry(key_path.to_string())
            .or_default()
            .push(record);
    }

    /// Sends everything collected since the last call to the dispatcher thread.
    pub fn dispatch_records(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        for (key_path, records) in pending {
            let batch = Batch {
                key_path,
                records: Arc::new(records),
            };
            if sender.send(batch).is_err() {
                warn!("trigger dispatcher is gone, dropping records");
                return;
            }
        }
    }

    /// Dispatches what is pending, then waits for every trigger to finish.
    /// Records appended afterwards are dropped.
    pub fn finish_and_wait(&self) {
        self.dispatch_records();
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("trigger dispatcher panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.finish_and_wait();
    }
}

fn run(matchers: &[TriggerMatcher], rx: Receiver<Batch>) {
    let mut firing: Vec<JoinHandle<()>> = Vec::new();
    for batch in rx {
        firing.retain(|h| !h.is_finished());
        for matcher in matchers.iter().filter(|m| m.matches(&batch.key_path)) {
            let trigger = Arc::clone(&matcher.trigger);
            let key_path = batch.key_path.clone();
            let records = Arc::clone(&batch.records);
            let spawned = thread::Builder::new()
                .name("tickvault-trigger".into())
                .spawn(move || fire(trigger.as_ref(), &key_path, &records));
            match spawned {
                Ok(handle) => firing.push(handle),
                Err(e) => error!(error = %e, "failed to spawn trigger thread"),
            }
        }
    }
    for handle in firing {
        let _ = handle.join();
    }
    debug!("trigger dispatcher stopped");
}

fn fire(trigger: &dyn Trigger, key_path: &str, records: &[Record]) {
    match panic::catch_unwind(AssertUnwindSafe(|| trigger.fire(key_path, records))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(key_path, error = %e, "trigger failed"),
        Err(_) => error!(key_path, "trigger panicked"),
    }
}
