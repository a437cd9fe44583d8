//! Tickvault - Alopex Year-File Time Bucket Storage Engine
//!
//! This crate stores financial time series (bars, quotes, trades) in one
//! binary file per bucket and year, addressed by a deterministic
//! time-to-offset mapping, behind a write-ahead log.
//!
//! # Components
//!
//! - [`format`]: year file layout, headers and time addressing
//! - [`TransactionPipe`]: queue of pending write commands
//! - [`Writer`] / [`write_csm`]: rows and column series into write commands
//! - [`wal::WalFile`]: commit protocol, checkpoints, rotation and replay
//! - [`Reader`]: forward and backward scans into [`ColumnSeries`]
//! - [`Deleter`]: in-place range deletion
//! - [`Dispatcher`]: post-write triggers
//! - [`StorageContext`]: ties everything together for one instance
//!
//! # Example
//!
//! ```rust,no_run
//! use alopex_tickvault::{
//!     BucketKey, Column, ColumnSeries, ColumnSeriesMap, Direction, Query, StorageConfig,
//!     StorageContext,
//! };
//!
//! # fn main() -> alopex_tickvault::Result<()> {
//! let ctx = StorageContext::open(StorageConfig::new("/var/lib/tickvault"))?;
//! let key = BucketKey::new("AAPL", "1Min", "OHLCV")?;
//!
//! let mut csm = ColumnSeriesMap::new();
//! csm.insert(
//!     key.clone(),
//!     ColumnSeries::new()
//!         .with_column("Epoch", Column::Int64(vec![1_577_836_800, 1_577_836_860]))
//!         .with_column("Close", Column::Float32(vec![300.1, 300.4])),
//! );
//! ctx.write_csm(&csm, false)?;
//!
//! let latest = ctx.read(Query::for_key(key).with_limit(1, Direction::Last))?;
//! # let _ = latest;
//! ctx.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod catalog;
pub mod columns;
pub mod config;
pub mod context;
pub mod delete;
pub mod error;
pub mod format;
pub mod key;
pub mod scan;
pub mod trigger;
pub mod txn;
pub mod wal;
pub mod writer;

pub use catalog::Catalog;
pub use columns::{Column, ColumnSeries, ColumnSeriesMap};
pub use config::{StorageConfig, SyncMode};
pub use context::StorageContext;
pub use delete::Deleter;
pub use error::{Result, StoreError};
pub use format::{BucketInfo, DataShape, ElementType, RecordType, Timeframe};
pub use key::BucketKey;
pub use scan::{Direction, Query, Reader};
pub use trigger::{Dispatcher, Record, Trigger, TriggerMatcher};
pub use txn::{TransactionPipe, WriteCommand};
pub use wal::ReplicationSender;
pub use writer::{write_csm, Writer};
