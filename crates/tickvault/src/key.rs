//! Bucket keys and the relative paths derived from them.
//!
//! A bucket is named by three items, one per category of the default schema
//! `Symbol/Timeframe/AttributeGroup`. The item key `AAPL/1Min/OHLCV` doubles as
//! the bucket's directory below the storage root, and each year file is
//! addressed in the WAL by `AAPL/1Min/OHLCV/2020.bin`.

use crate::error::{Result, StoreError};
use crate::format::Timeframe;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Category names of the default bucket schema, in path order.
pub const DEFAULT_CATEGORIES: [&str; 3] = ["Symbol", "Timeframe", "AttributeGroup"];

/// Default schema string appended to keys in their long form.
pub const DEFAULT_SCHEMA: &str = "Symbol/Timeframe/AttributeGroup";

/// Identity of one bucket: symbol, timeframe and attribute group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    symbol: String,
    timeframe: String,
    attribute_group: String,
}

impl BucketKey {
    /// Creates a key from its three items.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if an item is empty or contains `/` or `:`.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        attribute_group: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            attribute_group: attribute_group.into(),
        };
        for item in key.items() {
            if item.is_empty() || item.contains(['/', ':']) || item == "." || item == ".." {
                return Err(StoreError::InvalidKey(format!(
                    "{}/{}/{}",
                    key.symbol, key.timeframe, key.attribute_group
                )));
            }
        }
        Ok(key)
    }

    /// Parses `AAPL/1Min/OHLCV`, optionally followed by `:Symbol/Timeframe/AttributeGroup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for a wrong item count or a non-default schema.
    pub fn parse(s: &str) -> Result<Self> {
        let (items, schema) = match s.split_once(':') {
            Some((items, schema)) => (items, schema),
            None => (s, DEFAULT_SCHEMA),
        };
        if schema != DEFAULT_SCHEMA {
            return Err(StoreError::InvalidKey(format!("unsupported schema {schema}")));
        }
        let parts: Vec<&str> = items.split('/').collect();
        match parts.as_slice() {
            [symbol, timeframe, group] => Self::new(*symbol, *timeframe, *group),
            _ => Err(StoreError::InvalidKey(s.to_string())),
        }
    }

    /// Extracts the key and year from a WAL key path such as
    /// `AMZN/1Min/TICK/2017.bin`; any leading directories are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the path does not end in `A/B/C/YYYY.bin`.
    pub fn from_wal_key_path(path: &str) -> Result<(Self, i16)> {
        let invalid = || StoreError::InvalidKey(format!("bad WAL key path {path}"));
        let mut parts = path.rsplit('/');
        let file = parts.next().ok_or_else(invalid)?;
        let year = file
            .strip_suffix(".bin")
            .and_then(|y| y.parse::<i16>().ok())
            .ok_or_else(invalid)?;
        let group = parts.next().ok_or_else(invalid)?;
        let timeframe = parts.next().ok_or_else(invalid)?;
        let symbol = parts.next().ok_or_else(invalid)?;
        Ok((Self::new(symbol, timeframe, group)?, year))
    }

    /// Symbol item.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Timeframe item as written in the key.
    pub fn timeframe_str(&self) -> &str {
        &self.timeframe
    }

    /// Attribute group item.
    pub fn attribute_group(&self) -> &str {
        &self.attribute_group
    }

    /// Parsed timeframe.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimeframe` if the timeframe item does not parse.
    pub fn timeframe(&self) -> Result<Timeframe> {
        Timeframe::parse(&self.timeframe)
    }

    /// The three items in schema order.
    pub fn items(&self) -> [&str; 3] {
        [&self.symbol, &self.timeframe, &self.attribute_group]
    }

    /// Category names in schema order.
    pub fn categories(&self) -> [&'static str; 3] {
        DEFAULT_CATEGORIES
    }

    /// Item stored under the named category.
    pub fn item_in_category(&self, category: &str) -> Option<&str> {
        DEFAULT_CATEGORIES
            .iter()
            .position(|c| *c == category)
            .map(|i| self.items()[i])
    }

    /// Directory holding this bucket's year files.
    pub fn path_to_year_files(&self, root: &Path) -> PathBuf {
        root.join(&self.symbol)
            .join(&self.timeframe)
            .join(&self.attribute_group)
    }

    /// Relative path of a year file, as carried by WAL write commands.
    pub fn wal_key_path(&self, year: i16) -> String {
        format!("{self}/{year}.bin")
    }

    /// Long form including the category schema.
    pub fn with_schema(&self) -> String {
        format!("{self}:{DEFAULT_SCHEMA}")
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.symbol, self.timeframe, self.attribute_group
        )
    }
}

impl FromStr for BucketKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
