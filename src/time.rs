//! Time units and wall-clock helpers.
//!
//! Record deadlines are absolute epoch milliseconds so they survive restarts.
//! Durations travel as `(amount, TimeUnit)` pairs the way cache callers
//! express them, and are converted to milliseconds at the edges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Granularity of a TTL amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Nanoseconds in one unit.
    fn nanos(self) -> u128 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60_000_000_000,
            TimeUnit::Hours => 3_600_000_000_000,
            TimeUnit::Days => 86_400_000_000_000,
        }
    }

    /// Converts `amount` of this unit to milliseconds (truncating, saturating).
    pub fn to_millis(self, amount: u64) -> u64 {
        let ms = amount as u128 * self.nanos() / 1_000_000;
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    /// Converts milliseconds to this unit (truncating, saturating).
    pub fn from_millis(self, millis: u64) -> u64 {
        let amount = millis as u128 * 1_000_000 / self.nanos();
        u64::try_from(amount).unwrap_or(u64::MAX)
    }

    /// Converts `amount` of this unit to a [`Duration`].
    pub fn to_duration(self, amount: u64) -> Duration {
        let nanos = amount as u128 * self.nanos();
        let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
        Duration::new(secs, (nanos % 1_000_000_000) as u32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "NANOSECONDS",
            TimeUnit::Microseconds => "MICROSECONDS",
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
            TimeUnit::Days => "DAYS",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    /// Accepts full names in any case plus the short forms `ns`, `us`, `ms`,
    /// `s`, `m`, `h` and `d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(TimeUnit::Nanoseconds),
            "us" | "micros" | "microseconds" => Ok(TimeUnit::Microseconds),
            "ms" | "millis" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "secs" | "seconds" => Ok(TimeUnit::Seconds),
            "m" | "mins" | "minutes" => Ok(TimeUnit::Minutes),
            "h" | "hours" => Ok(TimeUnit::Hours),
            "d" | "days" => Ok(TimeUnit::Days),
            other => Err(format!("unknown time unit '{}'", other)),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
