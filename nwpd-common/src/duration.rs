//! Human readable durations ("500ms", "10s", "5m", "1h") for config files

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a duration such as `500ms`, `10s`, `5m` or `1h`.
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000u64)
    } else {
        (s, 1000u64)
    };

    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {:?}, use e.g. 500ms, 10s, 5m, 1h", s))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration {:?}", s));
    }
    Ok(Duration::from_millis((value * unit_ms as f64).round() as u64))
}

/// Format a duration the way `parse_duration` reads it back.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

/// `#[serde(with = "duration::option")]` for `Option<Duration>` fields
pub mod option {
    use super::*;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
