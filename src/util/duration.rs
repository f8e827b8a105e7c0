//! Interval parser for CLI arguments and environment variables.
//!
//! Supports:
//! - Bare seconds: `10`, `0`
//! - Single unit: `500ms`, `10s`, `5m`, `1h`
//! - Compound: `1m30s`, `1h15m`

use std::time::Duration;

/// Error type for interval parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationParseError {
    pub input: String,
    pub message: String,
}

impl std::fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse duration '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for DurationParseError {}

/// Parse an interval string into a [`Duration`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use metricsd::util::parse_duration;
///
/// assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let input = input.trim();
    let err = |message: &str| DurationParseError {
        input: input.to_string(),
        message: message.to_string(),
    };

    if input.is_empty() {
        return Err(err("empty duration"));
    }

    if input.chars().all(|c| c.is_ascii_digit()) {
        return input
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| err("number too large"));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(err("expected a number, e.g. 10s, 5m, 1h, 500ms"));
        }
        let number: u64 = rest[..digits].parse().map_err(|_| err("number too large"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(number),
            "s" => Duration::from_secs(number),
            "m" => Duration::from_secs(number.saturating_mul(60)),
            "h" => Duration::from_secs(number.saturating_mul(3600)),
            _ => return Err(err("unknown unit, use ms, s, m or h")),
        };
        rest = &rest[unit_len..];
        total = total.checked_add(part).ok_or_else(|| err("duration overflow"))?;
    }

    Ok(total)
}
