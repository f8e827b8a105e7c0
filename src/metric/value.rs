//! Metric kinds, values and their merge rules.
//!
//! A metric is either a counter (accumulated `u64`) or a gauge (last-sampled
//! `f64`). The two kinds never mix: once a name is bound to one kind, an
//! update of the other kind is rejected by the store.

use std::fmt;
use std::str::FromStr;

/// Kind tag of a metric, as it appears on the wire and in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// Returns the literal tag (`"counter"` or `"gauge"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = UnknownKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            other => Err(UnknownKindError {
                tag: other.to_string(),
            }),
        }
    }
}

/// Kind tag that is neither `counter` nor `gauge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKindError {
    pub tag: String,
}

impl fmt::Display for UnknownKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wrong type name: '{}'", self.tag)
    }
}

impl std::error::Error for UnknownKindError {}

/// Value text that does not match the numeric grammar of its kind.
///
/// An empty `input` means the value was absent altogether (structured
/// payloads that declare a kind but carry no matching field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: MetricKind,
    pub input: String,
}

impl ParseError {
    pub(crate) fn missing(kind: MetricKind) -> Self {
        Self {
            kind,
            input: String::new(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.input.is_empty() {
            write!(f, "missing {} value", self.kind)
        } else {
            write!(f, "invalid {} value '{}'", self.kind, self.input)
        }
    }
}

impl std::error::Error for ParseError {}

/// Current value of a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Parses value text according to the grammar of `kind`.
    ///
    /// Counters accept plain base-10 digits only (no sign, no whitespace).
    /// Gauges accept any finite decimal or exponent notation; NaN and
    /// infinities are rejected since they cannot be persisted as JSON numbers.
    pub fn parse(kind: MetricKind, text: &str) -> Result<Self, ParseError> {
        let err = || ParseError {
            kind,
            input: text.to_string(),
        };

        match kind {
            MetricKind::Counter => {
                if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(err());
                }
                text.parse::<u64>().map(MetricValue::Counter).map_err(|_| err())
            }
            MetricKind::Gauge => match text.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(MetricValue::Gauge(v)),
                _ => Err(err()),
            },
        }
    }

    /// Merges an incoming value into this one.
    ///
    /// Returns `None` when the kinds differ; callers must have rejected that
    /// case already, a mismatch is never coerced.
    pub fn merge(self, incoming: MetricValue) -> Option<MetricValue> {
        match (self, incoming) {
            (MetricValue::Counter(current), MetricValue::Counter(delta)) => {
                Some(MetricValue::Counter(merge_counter(current, delta)))
            }
            (MetricValue::Gauge(current), MetricValue::Gauge(sample)) => {
                Some(MetricValue::Gauge(merge_gauge(current, sample)))
            }
            _ => None,
        }
    }

    /// Value as used inside the canonical hash input: counters in base 10,
    /// gauges with exactly 6 decimal digits.
    pub fn canonical_text(&self) -> String {
        match self {
            MetricValue::Counter(v) => v.to_string(),
            MetricValue::Gauge(v) => format!("{:.6}", v),
        }
    }

    /// Value as rendered in plain-text wire responses: counters in base 10,
    /// gauges with 3 decimal digits.
    pub fn wire_text(&self) -> String {
        match self {
            MetricValue::Counter(v) => v.to_string(),
            MetricValue::Gauge(v) => format!("{:.3}", v),
        }
    }
}

/// Adds a counter delta to the accumulated total.
///
/// Overflow past `u64::MAX` wraps instead of panicking; totals are expected
/// to stay far below that range.
pub fn merge_counter(current: u64, delta: u64) -> u64 {
    current.wrapping_add(delta)
}

/// Replaces a gauge sample. The current value is discarded.
pub fn merge_gauge(_current: f64, incoming: f64) -> f64 {
    incoming
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_tag() {
        assert_eq!("counter".parse::<MetricKind>().unwrap(), MetricKind::Counter);
        assert_eq!("gauge".parse::<MetricKind>().unwrap(), MetricKind::Gauge);
        assert_eq!(MetricKind::Gauge.to_string(), "gauge");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "histogram".parse::<MetricKind>().unwrap_err();
        assert_eq!(err.tag, "histogram");
        assert!("Counter".parse::<MetricKind>().is_err());
    }

    #[test]
    fn counter_parse_accepts_digits_only() {
        assert_eq!(
            MetricValue::parse(MetricKind::Counter, "42").unwrap(),
            MetricValue::Counter(42)
        );
        assert_eq!(
            MetricValue::parse(MetricKind::Counter, "18446744073709551615").unwrap(),
            MetricValue::Counter(u64::MAX)
        );
        for bad in ["", "-1", "+1", "1.5", " 1", "abc", "18446744073709551616"] {
            assert!(
                MetricValue::parse(MetricKind::Counter, bad).is_err(),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn gauge_parse_rejects_non_finite() {
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "-2.5e3").unwrap(),
            MetricValue::Gauge(-2500.0)
        );
        for bad in ["", "nan", "inf", "1,5", "one"] {
            let err = MetricValue::parse(MetricKind::Gauge, bad).unwrap_err();
            assert_eq!(err.kind, MetricKind::Gauge);
        }
    }

    #[test]
    fn counter_merge_adds() {
        let merged = MetricValue::Counter(3).merge(MetricValue::Counter(4));
        assert_eq!(merged, Some(MetricValue::Counter(7)));
    }

    #[test]
    fn gauge_merge_replaces() {
        let merged = MetricValue::Gauge(3.0).merge(MetricValue::Gauge(-1.25));
        assert_eq!(merged, Some(MetricValue::Gauge(-1.25)));
    }

    #[test]
    fn merge_across_kinds_is_refused() {
        assert_eq!(MetricValue::Counter(1).merge(MetricValue::Gauge(1.0)), None);
        assert_eq!(MetricValue::Gauge(1.0).merge(MetricValue::Counter(1)), None);
    }

    #[test]
    fn canonical_and_wire_formats_differ_for_gauges() {
        let g = MetricValue::Gauge(1.1);
        assert_eq!(g.canonical_text(), "1.100000");
        assert_eq!(g.wire_text(), "1.100");

        let c = MetricValue::Counter(17);
        assert_eq!(c.canonical_text(), "17");
        assert_eq!(c.wire_text(), "17");
    }

    #[test]
    fn parse_error_messages() {
        let err = MetricValue::parse(MetricKind::Counter, "x").unwrap_err();
        assert_eq!(err.to_string(), "invalid counter value 'x'");
        assert_eq!(
            ParseError::missing(MetricKind::Gauge).to_string(),
            "missing gauge value"
        );
    }
}
