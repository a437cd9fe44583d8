//! Directory catalog of buckets and their year files.
//!
//! The catalog mirrors the on-disk tree below the storage root:
//!
//! ```text
//! root/
//! ├── AAPL/1Min/OHLCV/2019.bin
//! ├── AAPL/1Min/OHLCV/2020.bin
//! └── TSLA/1D/OHLCV/2020.bin
//! ```
//!
//! Existing year files are discovered when the catalog is opened. Metadata is
//! immutable per year; adding a year creates a sibling file with the shape of
//! the latest one.

use crate::error::{Result, StoreError};
use crate::format::BucketInfo;
use crate::key::BucketKey;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

type YearMap = BTreeMap<i16, Arc<BucketInfo>>;

/// In-memory index of the buckets stored below one root directory.
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    buckets: RwLock<HashMap<BucketKey, YearMap>>,
}

impl Catalog {
    /// Opens the catalog at `root`, creating the directory if needed and
    /// loading the header of every `SYMBOL/TF/GROUP/YYYY.bin` found.
    ///
    /// Files with unreadable headers are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created or listed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut buckets: HashMap<BucketKey, YearMap> = HashMap::new();
        for path in Self::discover(&root)? {
            let Some(rel) = path.strip_prefix(&root).ok().and_then(Path::to_str) else {
                continue;
            };
            let Ok((key, year)) = BucketKey::from_wal_key_path(rel) else {
                continue;
            };
            match BucketInfo::from_file(&path) {
                Ok(info) if info.year == year => {
                    buckets.entry(key).or_default().insert(year, Arc::new(info));
                }
                Ok(info) => warn!(path = ?path, header_year = info.year, "year file name does not match header"),
                Err(e) => warn!(path = ?path, error = %e, "skipping unreadable year file"),
            }
        }
        debug!(root = ?root, buckets = buckets.len(), "opened catalog");

        Ok(Self {
            root,
            buckets: RwLock::new(buckets),
        })
    }

    fn discover(root: &Path) -> Result<Vec<PathBuf>> {
        let mut level = vec![root.to_path_buf()];
        for _ in 0..3 {
            let mut next = Vec::new();
            for dir in level {
                for entry in fs::read_dir(&dir)?.flatten() {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        next.push(entry.path());
                    }
                }
            }
            level = next;
        }
        let mut files = Vec::new();
        for dir in level {
            for entry in fs::read_dir(&dir)?.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "bin") {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a new bucket and creates its first year file.
    ///
    /// `info.path` is replaced by the canonical location under the root. An
    /// already existing file is loaded instead of being overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created, or if an
    /// existing file has an invalid header.
    pub fn add_time_bucket(&self, key: &BucketKey, mut info: BucketInfo) -> Result<Arc<BucketInfo>> {
        let dir = key.path_to_year_files(&self.root);
        fs::create_dir_all(&dir)?;
        info.path = dir.join(format!("{}.bin", info.year));
        let info = self.create_or_load(info)?;
        self.buckets
            .write()
            .entry(key.clone())
            .or_default()
            .insert(info.year, Arc::clone(&info));
        debug!(key = %key, year = info.year, "added time bucket");
        Ok(info)
    }

    /// Makes sure the bucket has a file for `year`, creating it from the
    /// latest year's metadata when missing.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` for unknown buckets, or an I/O error.
    pub fn add_year_file(&self, key: &BucketKey, year: i16) -> Result<Arc<BucketInfo>> {
        let latest = {
            let buckets = self.buckets.read();
            let years = buckets
                .get(key)
                .ok_or_else(|| StoreError::BucketNotFound(key.to_string()))?;
            if let Some(info) = years.get(&year) {
                return Ok(Arc::clone(info));
            }
            years
                .values()
                .next_back()
                .map(Arc::clone)
                .ok_or_else(|| StoreError::BucketNotFound(key.to_string()))?
        };
        let info = self.create_or_load(latest.for_year(year))?;
        let mut buckets = self.buckets.write();
        let years = buckets.entry(key.clone()).or_default();
        // A concurrent caller may have won the race; keep the first entry.
        Ok(Arc::clone(years.entry(year).or_insert(info)))
    }

    fn create_or_load(&self, info: BucketInfo) -> Result<Arc<BucketInfo>> {
        match info.create_file() {
            Ok(()) => Ok(Arc::new(info)),
            Err(StoreError::FileAlreadyExists(path)) => Ok(Arc::new(BucketInfo::from_file(path)?)),
            Err(e) => Err(e),
        }
    }

    /// Metadata of the newest year file of a bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` if the bucket is unknown.
    pub fn latest_bucket_info(&self, key: &BucketKey) -> Result<Arc<BucketInfo>> {
        self.buckets
            .read()
            .get(key)
            .and_then(|years| years.values().next_back())
            .map(Arc::clone)
            .ok_or_else(|| StoreError::BucketNotFound(key.to_string()))
    }

    /// Metadata of one year file, if present.
    pub fn bucket_info(&self, key: &BucketKey, year: i16) -> Option<Arc<BucketInfo>> {
        self.buckets
            .read()
            .get(key)
            .and_then(|years| years.get(&year))
            .map(Arc::clone)
    }

    /// All year files of a bucket, ascending by year.
    pub fn year_files(&self, key: &BucketKey) -> Vec<Arc<BucketInfo>> {
        self.buckets
            .read()
            .get(key)
            .map(|years| years.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Returns true if the bucket is known.
    pub fn contains(&self, key: &BucketKey) -> bool {
        self.buckets.read().contains_key(key)
    }

    /// Keys of all known buckets, sorted.
    pub fn keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<BucketKey> = self.buckets.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolves a WAL key path such as `AAPL/1Min/OHLCV/2020.bin`.
    ///
    /// Files present on disk but not yet cached are loaded and registered.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for malformed paths, `BucketNotFound` if the file
    /// does not exist.
    pub fn path_to_bucket_info(&self, wal_key_path: &str) -> Result<Arc<BucketInfo>> {
        let (key, year) = BucketKey::from_wal_key_path(wal_key_path)?;
        if let Some(info) = self.bucket_info(&key, year) {
            return Ok(info);
        }
        let path = key.path_to_year_files(&self.root).join(format!("{year}.bin"));
        if !path.exists() {
            return Err(StoreError::BucketNotFound(wal_key_path.to_string()));
        }
        let info = Arc::new(BucketInfo::from_file(&path)?);
        let mut buckets = self.buckets.write();
        Ok(Arc::clone(
            buckets.entry(key).or_default().entry(year).or_insert(info),
        ))
    }

    /// Bucket owning a path below the root: a bucket directory or any file
    /// inside it.
    pub fn owning_bucket(&self, path: &Path) -> Option<BucketKey> {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let items: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .take(3)
            .collect();
        match items.as_slice() {
            [symbol, timeframe, group] => {
                let key = BucketKey::new(*symbol, *timeframe, *group).ok()?;
                self.contains(&key).then_some(key)
            }
            _ => None,
        }
    }
}
