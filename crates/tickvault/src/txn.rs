//! Transaction pipe: the in-process queue between writers and the WAL.
//!
//! Writers enqueue [`WriteCommand`]s; the flusher drains whatever is queued
//! into one transaction group (TG) and stamps it with the current TGID.
//!
//! ```text
//! Writer ─┐
//! Writer ─┼─> [ bounded queue ] ──drain(n)──> TG{tgid, commands} ──> WAL
//! Writer ─┘
//! ```

use crate::format::{DataShape, RecordType};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

/// Fraction of the capacity at which the queue-depth check forces a flush.
pub const FLUSH_THRESHOLD_PERCENT: usize = 80;

/// One primary-file write: a FIXED record, or a group of VARIABLE rows sharing
/// an interval.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    /// Record layout of the target file.
    pub record_type: RecordType,
    /// Target file relative to the root, `SYMBOL/TF/GROUP/YYYY.bin`.
    pub wal_key_path: String,
    /// Length of one VARIABLE row including ticks; zero for FIXED.
    pub var_rec_len: i32,
    /// Byte offset of the slot.
    pub offset: i64,
    /// Interval index of the slot.
    pub index: i64,
    /// Row payload without the index word.
    pub data: Vec<u8>,
    /// Column shapes, carried so replay can recreate a missing bucket.
    pub shapes: Vec<DataShape>,
}

/// Bounded queue of write commands plus the transaction group ID counter.
#[derive(Debug)]
pub struct TransactionPipe {
    queue: Mutex<VecDeque<WriteCommand>>,
    not_full: Condvar,
    capacity: usize,
    tgid: AtomicI64,
}

impl TransactionPipe {
    /// Creates a pipe holding at most `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            tgid: AtomicI64::new(now_nanos()),
        }
    }

    /// Queues a command, blocking while the pipe is full.
    pub fn enqueue(&self, command: WriteCommand) {
        let mut queue = self.queue.lock();
        while queue.len() >= self.capacity {
            self.not_full.wait(&mut queue);
        }
        queue.push_back(command);
    }

    /// Removes up to `n` commands in arrival order.
    pub fn drain(&self, n: usize) -> Vec<WriteCommand> {
        let mut queue = self.queue.lock();
        let n = n.min(queue.len());
        let drained: Vec<WriteCommand> = queue.drain(..n).collect();
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued commands.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true once the queue reaches the flush threshold.
    pub fn should_flush(&self) -> bool {
        self.len() * 100 >= self.capacity * FLUSH_THRESHOLD_PERCENT
    }

    /// ID of the transaction group currently being filled.
    pub fn tgid(&self) -> i64 {
        self.tgid.load(Ordering::SeqCst)
    }

    /// Advances to a new TGID: the current UTC time in nanoseconds, or one
    /// past the previous ID if the clock has not moved forward.
    pub fn new_tgid(&self) -> i64 {
        let mut prev = self.tgid.load(Ordering::SeqCst);
        loop {
            let next = now_nanos().max(prev + 1);
            match self
                .tgid
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for TransactionPipe {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_QUEUE_CAPACITY)
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn command(index: i64) -> WriteCommand {
        WriteCommand {
            record_type: RecordType::Fixed,
            wal_key_path: "AAPL/1Min/OHLCV/2020.bin".into(),
            var_rec_len: 0,
            offset: index * 32,
            index,
            data: vec![1, 2, 3],
            shapes: Vec::new(),
        }
    }

    #[test]
    fn test_tgid_strictly_increases() {
        let pipe = TransactionPipe::new(16);
        let mut last = pipe.tgid();
        for _ in 0..10_000 {
            let next = pipe.new_tgid();
            assert!(next > last);
            assert_eq!(pipe.tgid(), next);
            last = next;
        }
    }

    #[test]
    fn test_drain_preserves_order() {
        let pipe = TransactionPipe::new(16);
        for i in 1..=5 {
            pipe.enqueue(command(i));
        }
        assert_eq!(pipe.len(), 5);

        let first = pipe.drain(3);
        assert_eq!(first.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        let rest = pipe.drain(10);
        assert_eq!(rest.iter().map(|c| c.index).collect::<Vec<_>>(), vec![4, 5]);
        assert!(pipe.is_empty());
    }

    #[test]
    fn test_flush_threshold() {
        let pipe = TransactionPipe::new(10);
        for i in 0..7 {
            pipe.enqueue(command(i));
        }
        assert!(!pipe.should_flush());
        pipe.enqueue(command(7));
        assert!(pipe.should_flush());
    }

    #[test]
    fn test_enqueue_blocks_until_drained() {
        let pipe = Arc::new(TransactionPipe::new(2));
        pipe.enqueue(command(1));
        pipe.enqueue(command(2));

        let producer = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || pipe.enqueue(command(3)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pipe.len(), 2);

        assert_eq!(pipe.drain(1).len(), 1);
        producer.join().unwrap();
        assert_eq!(pipe.len(), 2);
    }
}
