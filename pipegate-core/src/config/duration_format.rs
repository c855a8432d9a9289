//! Humantime durations (`10s`, `1m 30s`) for configuration files.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Parse a duration string.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| format!("invalid duration '{s}': {e} (expected e.g. 10s, 1m 30s)"))
}

/// Deserialize a duration from a string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Serialize a duration to a humantime string.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime::format_duration(*duration)
        .to_string()
        .serialize(serializer)
}
