//! Timeframe strings such as `1Min`, `5Min`, `1H` and `1D`.

use crate::error::{Result, StoreError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
/// One day.
pub const DAY: Duration = Duration::from_secs(86_400);
const WEEK: Duration = Duration::from_secs(7 * 86_400);
const YEAR: Duration = Duration::from_secs(365 * 86_400);

// Ordered by unit size; the first matching suffix wins when parsing and the
// largest exact unit wins when formatting.
const UNITS: &[(&str, Duration)] = &[
    ("Sec", SECOND),
    ("S", SECOND),
    ("Min", MINUTE),
    ("T", MINUTE),
    ("H", HOUR),
    ("D", DAY),
    ("W", WEEK),
    ("Y", YEAR),
];

/// A bucket timeframe: its canonical string and the interval length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    name: String,
    duration: Duration,
}

impl Timeframe {
    /// Parses strings like `1Min`, `10Sec`, `4H` or `1D`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimeframe` when the suffix is unknown or the count is
    /// not a positive integer.
    pub fn parse(s: &str) -> Result<Self> {
        let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
        let (count, suffix) = s.split_at(digits);
        let unit = UNITS
            .iter()
            .find(|(name, _)| *name == suffix)
            .map(|(_, d)| *d)
            .ok_or_else(|| StoreError::InvalidTimeframe(s.to_string()))?;
        let count: u32 = count
            .parse()
            .map_err(|_| StoreError::InvalidTimeframe(s.to_string()))?;
        if count == 0 {
            return Err(StoreError::InvalidTimeframe(s.to_string()));
        }
        Ok(Self {
            name: s.to_string(),
            duration: unit * count,
        })
    }

    /// Builds a timeframe from an interval length, naming it with the largest
    /// unit that divides it exactly.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimeframe` for sub-second or fractional-second intervals.
    pub fn from_duration(duration: Duration) -> Result<Self> {
        if duration < SECOND || duration.subsec_nanos() != 0 {
            return Err(StoreError::InvalidTimeframe(format!("{duration:?}")));
        }
        let secs = duration.as_secs();
        let (suffix, unit) = [("Y", YEAR), ("W", WEEK), ("D", DAY), ("H", HOUR), ("Min", MINUTE)]
            .into_iter()
            .find(|(_, unit)| secs % unit.as_secs() == 0)
            .unwrap_or(("Sec", SECOND));
        Ok(Self {
            name: format!("{}{}", secs / unit.as_secs(), suffix),
            duration,
        })
    }

    /// Builds a timeframe from an interval length in nanoseconds, as stored in
    /// the year-file header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTimeframe` for non-positive or sub-second values.
    pub fn from_nanos(nanos: i64) -> Result<Self> {
        let nanos = u64::try_from(nanos)
            .map_err(|_| StoreError::InvalidTimeframe(format!("{nanos}ns")))?;
        Self::from_duration(Duration::from_nanos(nanos))
    }

    /// Canonical string, as used in bucket keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Interval length in nanoseconds.
    pub fn nanos(&self) -> i64 {
        self.duration.as_nanos() as i64
    }

    /// Number of intervals in a 24 hour day (zero for timeframes above a day).
    pub fn intervals_per_day(&self) -> i64 {
        (DAY.as_nanos() / self.duration.as_nanos()) as i64
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for Timeframe {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
