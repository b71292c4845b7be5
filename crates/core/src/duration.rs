// SPDX-License-Identifier: MIT

//! A duration newtype that (de)serializes using Go-style duration
//! strings (`"24h"`, `"90s"`, `"1h30m"`), matching the configuration
//! file format this supervisor reads and writes.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `Duration` that serializes as a Go-style duration string instead
/// of serde's default numeric representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(d: ConfigDuration) -> Self {
        d.0
    }
}

/// Error returned when a duration string doesn't parse.
#[derive(Debug, thiserror::Error)]
#[error("invalid duration string {0:?}")]
pub struct ParseDurationError(String);

/// Parse a Go-style duration string: a sequence of `<number><unit>`
/// pairs where unit is one of `ns`, `us`, `ms`, `s`, `m`, `h`. Mirrors
/// the subset of `time.ParseDuration` this supervisor's config needs
/// (`"24h"`, `"90s"`, `"1h30m"`); a bare number is rejected, matching
/// the original's trimmed-quote-then-parse behavior.
pub fn parse_go_duration(s: &str) -> Result<Duration, ParseDurationError> {
    let trimmed = s.trim().trim_matches('"');
    if trimmed.is_empty() {
        return Err(ParseDurationError(s.to_string()));
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut chars = trimmed.char_indices().peekable();
    let mut any = false;

    while let Some(&(start, c)) = chars.peek() {
        if !(c.is_ascii_digit() || c == '.') {
            return Err(ParseDurationError(s.to_string()));
        }
        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let number: f64 = trimmed[start..end]
            .parse()
            .map_err(|_| ParseDurationError(s.to_string()))?;

        let unit_start = end;
        let mut unit_end = end;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_alphabetic() || c == '\u{b5}' {
                unit_end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let unit = &trimmed[unit_start..unit_end];
        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "us" | "\u{b5}s" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60_000_000_000.0,
            "h" => 3_600_000_000_000.0,
            _ => return Err(ParseDurationError(s.to_string())),
        };
        total += Duration::from_nanos((number * nanos_per_unit) as u64);
        any = true;
    }

    if !any {
        return Err(ParseDurationError(s.to_string()));
    }
    Ok(total)
}

/// Render a duration in the canonical `h`/`m`/`s` form Go's
/// `time.Duration.String()` produces for the ranges this supervisor
/// cares about (seconds up through many hours).
pub fn format_go_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let total_nanos = d.as_nanos();
    if total_nanos < 1_000_000_000 {
        // Sub-second: render as fractional seconds, trimming trailing zeros.
        let secs = d.as_secs_f64();
        let mut s = format!("{secs:.9}");
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        return format!("{s}s");
    }

    let total_secs = d.as_secs();
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;

    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{m}m"));
    }
    out.push_str(&format!("{s}s"));
    out
}

impl Serialize for ConfigDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_go_duration(self.0))
    }
}

struct ConfigDurationVisitor;

impl<'de> Visitor<'de> for ConfigDurationVisitor {
    type Value = ConfigDuration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a Go-style duration string such as \"24h\"")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        parse_go_duration(v)
            .map(ConfigDuration)
            .map_err(|e| de::Error::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(ConfigDurationVisitor)
    }
}
