//! Timestamps for rating writes

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp representing a point in time with nanosecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since Unix epoch
    nanos: i64,
}

impl Timestamp {
    /// Create a timestamp from nanoseconds since Unix epoch
    pub fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// Create a timestamp from seconds since Unix epoch
    pub fn from_secs(secs: i64) -> Self {
        Self {
            nanos: secs * 1_000_000_000,
        }
    }

    /// Get current timestamp
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Parse an RFC 3339 timestamp such as `2019-06-01T17:03:11.123456Z`
    pub fn parse_rfc3339(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::from(dt.with_timezone(&Utc)))
            .map_err(|e| Error::Serialization(format!("invalid timestamp {s:?}: {e}")))
    }

    /// Get nanoseconds since Unix epoch
    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    /// Get milliseconds since Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.nanos / 1_000_000
    }

    /// Get seconds since Unix epoch
    pub fn as_secs(&self) -> i64 {
        self.nanos.div_euclid(1_000_000_000)
    }

    /// Convert to chrono DateTime
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.as_secs(), self.nanos.rem_euclid(1_000_000_000) as u32)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            nanos: dt.timestamp_nanos_opt().unwrap_or(0),
        }
    }
}
