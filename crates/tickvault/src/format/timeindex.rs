//! Time ↔ slot addressing and interval tick conversion.
//!
//! All calendar math is done in UTC. A slot index is 1-based and counts
//! whole intervals since January 1st of the timestamp's year:
//!
//! ```text
//! index  = 1 + (t - Jan1) / timeframe
//! offset = HEADER_SIZE + (index - 1) * record_len
//! ```
//!
//! Sub-interval precision is kept as a 32-bit "interval tick" count, the
//! fraction of the interval elapsed scaled to `u32::MAX`.

use super::HEADER_SIZE;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::time::Duration;

/// `u32::MAX / 86400`, precomputed to avoid a floating point division.
pub const TICKS_PER_INTERVAL_DIV_SECS_PER_DAY: f64 = 49_710.269_629_629_629_629_629_629_629;

/// `86400 * 10^9 / 2^32`, the nanoseconds per tick of a one-day interval.
const NANOS_PER_TICK_DAY: f64 = 20_116.567_611_7;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Epoch seconds of January 1st 00:00:00 UTC of `year`.
pub fn year_start_epoch(year: i32) -> i64 {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp())
        // Out-of-range years collapse to the epoch; callers use i16 years.
        .unwrap_or_default()
}

/// Nanoseconds in a calendar year.
pub fn nanos_in_year(year: i32) -> i64 {
    (year_start_epoch(year + 1) - year_start_epoch(year)) * NANOS_PER_SEC
}

/// Size in bytes of a freshly created year file.
pub fn file_size(timeframe: Duration, year: i32, record_len: i32) -> i64 {
    let slots = nanos_in_year(year) / timeframe.as_nanos().max(1) as i64;
    HEADER_SIZE + slots * i64::from(record_len)
}

/// Converts a timestamp to its 1-based slot index within its year.
pub fn time_to_index(t: DateTime<Utc>, timeframe: Duration) -> i64 {
    let since_jan1 = (t.timestamp() - year_start_epoch(t.year())) * NANOS_PER_SEC
        + i64::from(t.timestamp_subsec_nanos());
    1 + since_jan1 / timeframe.as_nanos().max(1) as i64
}

/// Converts epoch seconds to a slot index.
pub fn epoch_to_index(epoch: i64, timeframe: Duration) -> i64 {
    time_to_index(epoch_to_time(epoch, 0), timeframe)
}

/// Byte offset of slot `index`.
pub fn index_to_offset(index: i64, record_len: i32) -> i64 {
    (index - 1) * i64::from(record_len) + HEADER_SIZE
}

/// Byte offset of the slot holding `t`.
pub fn time_to_offset(t: DateTime<Utc>, timeframe: Duration, record_len: i32) -> i64 {
    index_to_offset(time_to_index(t, timeframe), record_len)
}

/// Start of slot `index` of `year`, in epoch seconds.
pub fn index_to_epoch(index: i64, timeframe: Duration, year: i32) -> i64 {
    let nanos = (index - 1) * timeframe.as_nanos() as i64;
    year_start_epoch(year) + nanos.div_euclid(NANOS_PER_SEC)
}

/// Start of slot `index` of `year`.
pub fn index_to_time(index: i64, timeframe: Duration, year: i32) -> DateTime<Utc> {
    let nanos = (index - 1) * timeframe.as_nanos() as i64;
    epoch_to_time(
        year_start_epoch(year) + nanos.div_euclid(NANOS_PER_SEC),
        nanos.rem_euclid(NANOS_PER_SEC) as u32,
    )
}

/// Start of an interval derived from intervals-per-day, truncated to whole
/// seconds. Tick encoding is relative to this base.
pub fn interval_start_epoch(index: i64, intervals_per_day: i64, year: i32) -> i64 {
    let second_of_year = ((index - 1) as f64 * 86_400.0 / intervals_per_day.max(1) as f64) as i64;
    year_start_epoch(year) + second_of_year
}

/// Number of interval ticks between the start of slot `index` and `t`.
pub fn interval_ticks(t: DateTime<Utc>, index: i64, intervals_per_day: i64) -> u32 {
    let base = interval_start_epoch(index, intervals_per_day, t.year());
    let seconds =
        (t.timestamp() - base) as f64 + f64::from(t.timestamp_subsec_nanos()) / 1_000_000_000.0;
    let ticks_per_second = intervals_per_day as f64 * TICKS_PER_INTERVAL_DIV_SECS_PER_DAY;
    (ticks_per_second * seconds).round().min(f64::from(u32::MAX)) as u32
}

/// Expands interval ticks back to `(epoch seconds, nanoseconds)`.
///
/// Results within one tick of a whole second are snapped to it, so whole
/// second timestamps come back exactly.
pub fn time_from_ticks(interval_start: i64, intervals_per_day: i64, ticks: u32) -> (i64, u32) {
    let nanos_per_tick = NANOS_PER_TICK_DAY / intervals_per_day.max(1) as f64;
    let mut nanos = f64::from(ticks) * nanos_per_tick;
    let whole = (nanos / NANOS_PER_SEC as f64).round() * NANOS_PER_SEC as f64;
    if (nanos - whole).abs() <= nanos_per_tick {
        nanos = whole;
    }
    let nanos = nanos.round() as i64;
    (
        interval_start + nanos / NANOS_PER_SEC,
        (nanos % NANOS_PER_SEC) as u32,
    )
}

/// Builds a UTC timestamp, clamping impossible values to the epoch.
pub fn epoch_to_time(secs: i64, nanos: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}
