//! Storage configuration.
//!
//! [`StorageConfig`] is plain data: it can be built in code with the `with_*`
//! builders or loaded from TOML. Missing keys fall back to the `DEFAULT_*`
//! constants below.
//!
//! ```toml
//! root_directory = "/project/data"
//! wal_flush_interval = 500        # milliseconds
//! primary_flush_interval = 60000  # milliseconds
//! wal_rotate_interval = 5         # primary flush cycles
//! sync_mode = "fsync"
//! ```

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between WAL flushes.
pub const DEFAULT_WAL_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Default interval between primary checkpoints.
pub const DEFAULT_PRIMARY_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of primary checkpoints between WAL truncations.
pub const DEFAULT_WAL_ROTATE_INTERVAL: u32 = 5;

/// Default capacity of the transaction pipe, in write commands.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000_000;

/// Sync mode for WAL and primary file durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Fsync data and metadata (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl SyncMode {
    /// Syncs `file` according to this mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync call fails.
    pub fn sync(self, file: &File) -> Result<()> {
        match self {
            SyncMode::Fsync => file.sync_all()?,
            SyncMode::Fdatasync => file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }
}

/// Configuration of one storage context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding bucket directories and WAL files.
    pub root_directory: PathBuf,
    /// Skip the WAL and write primary files directly.
    pub wal_bypass: bool,
    /// Interval between WAL flushes.
    #[serde(with = "duration_ms")]
    pub wal_flush_interval: Duration,
    /// Interval between primary checkpoints.
    #[serde(with = "duration_ms")]
    pub primary_flush_interval: Duration,
    /// Number of primary checkpoints after which the WAL is truncated.
    pub wal_rotate_interval: u32,
    /// Store VARIABLE row groups uncompressed.
    pub disable_variable_compression: bool,
    /// Open without a WAL; writers cannot be created.
    pub read_only: bool,
    /// Run the background flusher thread.
    pub background_flusher: bool,
    /// Durability of WAL and primary syncs.
    pub sync_mode: SyncMode,
    /// Capacity of the transaction pipe.
    pub queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("data"),
            wal_bypass: false,
            wal_flush_interval: DEFAULT_WAL_FLUSH_INTERVAL,
            primary_flush_interval: DEFAULT_PRIMARY_FLUSH_INTERVAL,
            wal_rotate_interval: DEFAULT_WAL_ROTATE_INTERVAL,
            disable_variable_compression: false,
            read_only: false,
            background_flusher: true,
            sync_mode: SyncMode::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// Creates a configuration rooted at `root` with default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: root.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the text is not valid TOML or a value has the
    /// wrong type.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or `Config` if it
    /// does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns `Config` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Checks that intervals and capacities are usable.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.wal_flush_interval.is_zero() {
            return Err(StoreError::Config("wal_flush_interval must be positive".into()));
        }
        if self.primary_flush_interval.is_zero() {
            return Err(StoreError::Config(
                "primary_flush_interval must be positive".into(),
            ));
        }
        if self.wal_rotate_interval == 0 {
            return Err(StoreError::Config("wal_rotate_interval must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StoreError::Config("queue_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Sets the root directory.
    pub fn with_root_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_directory = root.into();
        self
    }

    /// Enables or disables WAL bypass.
    pub fn with_wal_bypass(mut self, bypass: bool) -> Self {
        self.wal_bypass = bypass;
        self
    }

    /// Sets the WAL flush interval.
    pub fn with_wal_flush_interval(mut self, interval: Duration) -> Self {
        self.wal_flush_interval = interval;
        self
    }

    /// Sets the primary checkpoint interval.
    pub fn with_primary_flush_interval(mut self, interval: Duration) -> Self {
        self.primary_flush_interval = interval;
        self
    }

    /// Sets the number of checkpoints between WAL truncations.
    pub fn with_wal_rotate_interval(mut self, cycles: u32) -> Self {
        self.wal_rotate_interval = cycles;
        self
    }

    /// Stores VARIABLE row groups uncompressed.
    pub fn with_disable_variable_compression(mut self, disable: bool) -> Self {
        self.disable_variable_compression = disable;
        self
    }

    /// Opens the context read-only.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enables or disables the background flusher thread.
    pub fn with_background_flusher(mut self, enabled: bool) -> Self {
        self.background_flusher = enabled;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets the transaction pipe capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
