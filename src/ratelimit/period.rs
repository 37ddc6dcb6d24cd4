//! Time units and period keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::NetquotaError;

/// Granularity of a rate limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeUnit {
    /// All units, in the order cleanup visits them.
    pub const ALL: [TimeUnit; 3] = [TimeUnit::Minute, TimeUnit::Hour, TimeUnit::Day];

    /// The prefix used in period keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
        }
    }

    fn timestamp_format(&self) -> &'static str {
        match self {
            TimeUnit::Minute => "%Y-%m-%dT%H:%M",
            TimeUnit::Hour => "%Y-%m-%dT%H",
            TimeUnit::Day => "%Y-%m-%d",
        }
    }

    /// Key of the period that `now` falls into.
    pub fn period_key(&self, now: DateTime<Utc>) -> PeriodKey {
        PeriodKey {
            unit: *self,
            key: format!("{}.{}", self.as_str(), now.format(self.timestamp_format())),
        }
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = NetquotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "minute" | "minutes" => Ok(TimeUnit::Minute),
            "h" | "hour" | "hours" => Ok(TimeUnit::Hour),
            "d" | "day" | "days" => Ok(TimeUnit::Day),
            other => Err(NetquotaError::Config(format!("Unknown time unit `{}`", other))),
        }
    }
}

/// Identifies one time bucket, e.g. `minute.2024-03-01T12:05`.
///
/// Keys of the same unit order chronologically when compared as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeriodKey {
    unit: TimeUnit,
    key: String,
}

impl PeriodKey {
    /// The unit this period belongs to.
    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// The formatted key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Whether this period ends before `current` begins.
    ///
    /// Periods of different units are never comparable.
    pub fn is_before(&self, current: &PeriodKey) -> bool {
        self.unit == current.unit && self.key < current.key
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
