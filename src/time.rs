use std::fmt;

use chrono::{DateTime, Utc};

const MICROS_PER_SEC: i64 = 1_000_000;

/// Wall-clock capture with microsecond resolution.
///
/// The seconds field is the Unix time truncated to 32 bits, which is what goes
/// on the wire. Timestamps from different hosts are not assumed to share a
/// synchronized clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: u32,
    /// Microseconds within the second (0..1_000_000).
    pub micros: u32,
}

impl Timestamp {
    pub fn new(secs: u32, micros: u32) -> Self {
        Timestamp { secs, micros }
    }

    /// Captures the current time.
    ///
    /// ```
    /// use owd_suite::time::Timestamp;
    /// let now = Timestamp::now();
    /// println!("Timestamp is {}", now);
    /// ```
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    fn from_datetime(date: DateTime<Utc>) -> Self {
        Timestamp {
            secs: date.timestamp() as u32,
            micros: date.timestamp_subsec_micros().min(999_999),
        }
    }

    fn as_micros(&self) -> i64 {
        self.secs as i64 * MICROS_PER_SEC + self.micros as i64
    }

    /// Absolute distance between two timestamps in fractional milliseconds.
    pub fn abs_diff_ms(&self, other: &Timestamp) -> f64 {
        (self.as_micros() - other.as_micros()).abs() as f64 / 1000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}
