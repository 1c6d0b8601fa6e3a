//! Duration parsing and formatting for payloads and stored records.
//!
//! Accepted inputs are integer seconds (`3600`, `"3600"`) or a number with one
//! of the suffixes `ms`, `s`, `m`, `h` (`"1h"`, `"250ms"`). Precision is one
//! millisecond.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parses a duration from its textual form.
///
/// # Errors
///
/// Returns a description of the problem if `input` is not a valid duration.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid duration '{input}'"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    let millis_per_unit = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60 * 1_000,
        "h" => 60 * 60 * 1_000,
        _ => return Err(format!("unknown duration unit '{unit}' in '{input}'")),
    };
    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration '{input}' is too large"))
}

/// Formats a duration in the largest unit that represents it exactly.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1_000 != 0 {
        return format!("{millis}ms");
    }
    let secs = millis / 1_000;
    if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Converts a duration to whole milliseconds, saturating.
#[must_use]
pub fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, as_millis_u64)
}

/// Serde adapter: writes [`format_duration`], reads integer seconds or
/// [`parse_duration`] text.
pub mod serde_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Serializes `duration` as text.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    /// Deserializes a duration from integer seconds or text.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is neither.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
