//! Recurring schedules expressed as interval strings (`30s`, `1m`, `2h`, `1d`).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::ConfigError;

/// Recurring schedule of a task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub interval: String,
}

impl Schedule {
    pub fn every(interval: impl Into<String>) -> Self {
        Self {
            interval: interval.into(),
        }
    }

    /// Parsed interval length.
    pub fn duration(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.interval)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.interval)
    }
}

/// Parse an interval such as `"1m"` into a duration.
///
/// Supported units: `s`, `m`, `h`, `d`. The amount must be positive.
pub fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        field: "schedule.interval".to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let raw_trimmed = raw.trim();
    let split_at = raw_trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit (expected s, m, h or d)"))?;
    let (amount, unit) = raw_trimmed.split_at(split_at);
    let amount: u64 = amount
        .parse()
        .map_err(|_| invalid("amount must be a positive integer"))?;
    if amount == 0 {
        return Err(invalid("amount must be a positive integer"));
    }

    let seconds_per_unit = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(invalid("unknown unit (expected s, m, h or d)")),
    };
    Ok(Duration::from_secs(amount.saturating_mul(seconds_per_unit)))
}
