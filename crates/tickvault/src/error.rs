//! Error and Result types for tickvault storage operations.

use crate::format::ElementType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for tickvault operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for storage engine operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Year-file header could not be decoded.
    #[error("Invalid header in {path:?}: {reason}")]
    InvalidHeader {
        /// Path of the offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A tag or field in a binary structure has an unknown value.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Unsupported year-file format version.
    #[error("Unsupported file info version: {0}")]
    UnsupportedVersion(i64),

    /// Files of one bucket disagree on their record length.
    #[error("Record length not consistent across files: expected {expected}, got {actual}")]
    RecordLengthNotConsistent {
        /// Record length of the first file in the plan.
        expected: i32,
        /// Record length of the mismatching file.
        actual: i32,
    },

    /// A WAL frame started with an unknown message ID.
    #[error("Invalid WAL message ID: {0}")]
    InvalidMessageId(u8),

    /// Transaction group checksum does not match its content.
    #[error("Checksum mismatch: expected {expected:02x?}, got {actual:02x?}")]
    ChecksumMismatch {
        /// Checksum stored in the WAL.
        expected: [u8; 16],
        /// Checksum computed from the data read.
        actual: [u8; 16],
    },

    /// Fewer bytes were available than the frame declared.
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// WAL replay failed. When `cont` is set the caller moves the file aside
    /// and carries on instead of refusing to start.
    #[error("Replay error: {reason} (continue: {cont})")]
    Replay {
        /// Description of the failure.
        reason: String,
        /// Whether startup may proceed.
        cont: bool,
    },

    /// The instance has no active WAL, so writes are not possible.
    #[error("There is not an active WAL file for this instance, so cannot write")]
    NoActiveWal,

    /// The WAL file is owned by another instance or in the wrong state.
    #[error("WAL state error: {0}")]
    WalState(String),

    /// Incoming columns do not match the on-disk bucket shape.
    #[error("Schema mismatch for {key}: {reason}")]
    SchemaMismatch {
        /// Bucket the write was addressed to.
        key: String,
        /// What did not match.
        reason: String,
    },

    /// A column required by the bucket is absent from the input.
    #[error("Missing column {column} for {key}")]
    MissingColumn {
        /// Bucket the write was addressed to.
        key: String,
        /// Name of the missing column.
        column: String,
    },

    /// A column cannot be converted to the requested element type.
    #[error("Cannot coerce column {column} from {from:?} to {to:?}")]
    UnsupportedCoercion {
        /// Name of the column.
        column: String,
        /// Source element type.
        from: ElementType,
        /// Target element type.
        to: ElementType,
    },

    /// Bucket key string could not be parsed.
    #[error("Invalid bucket key: {0}")]
    InvalidKey(String),

    /// Timeframe string or duration is not supported.
    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    /// Bucket is unknown to the catalog.
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Refused to overwrite an existing year file.
    #[error("File already exists: {0:?}")]
    FileAlreadyExists(PathBuf),

    /// Timestamp outside what the file format can address.
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(i64),

    /// LAST scans need a row limit.
    #[error("Reverse scan only supported with a limited result set")]
    UnlimitedReverseScan,

    /// Snappy compression failed.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// Snappy decompression failed.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// The background flusher reported a failure or is gone.
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StoreError {
    /// Returns true for truncated reads, which replay treats as a clean stop.
    pub fn is_short_read(&self) -> bool {
        match self {
            Self::ShortRead { .. } => true,
            Self::IoError(err) => err.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    /// Returns true for replay errors that allow startup to continue.
    pub fn is_continuable(&self) -> bool {
        matches!(self, Self::Replay { cont: true, .. })
    }

    pub(crate) fn replay(reason: impl Into<String>, cont: bool) -> Self {
        Self::Replay {
            reason: reason.into(),
            cont,
        }
    }
}
