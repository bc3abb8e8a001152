use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};

/// A point in time, stored as microseconds since the Unix epoch.
///
/// Every readiness dispatch carries the `Timestamp` at which the poll call
/// returned, so handlers know when their events were collected without
/// calling into the clock themselves.
///
/// # Examples
///
/// ```
/// use muxio::Timestamp;
///
/// let ts = Timestamp::now();
/// assert!(ts.valid());
/// println!("{}", ts); // e.g. 2026/08/01 12:30:45
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    /// Returns the current wall-clock time, at microsecond resolution.
    pub fn now() -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            micros_since_epoch: since_epoch.as_micros() as i64,
        }
    }

    /// Creates a `Timestamp` from a microseconds-since-epoch count.
    pub fn from_micros(micros_since_epoch: i64) -> Timestamp {
        Timestamp { micros_since_epoch }
    }

    /// Returns the microseconds-since-epoch count.
    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }

    /// Returns `true` unless this is the zero (default) timestamp.
    pub fn valid(&self) -> bool {
        self.micros_since_epoch > 0
    }
}

impl fmt::Display for Timestamp {
    /// Formats as `YYYY/MM/DD HH:MM:SS` in local time.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::from_timestamp_micros(self.micros_since_epoch) {
            Some(utc) => write!(f, "{}", utc.with_timezone(&Local).format("%Y/%m/%d %H:%M:%S")),
            None => write!(f, "<invalid timestamp {}>", self.micros_since_epoch),
        }
    }
}
