use serde::{Deserialize, Serialize};

use super::value::{MetricKind, MetricValue, ParseError, UnknownKindError};

/// A named metric with its current value and optional integrity hash.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub value: MetricValue,
    /// Hex HMAC-SHA-256 over the canonical form. Present only when a key is configured.
    pub hash: Option<String>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            value,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.hash = hash;
        self
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Plain-text wire rendering of the value.
    pub fn wire_text(&self) -> String {
        self.value.wire_text()
    }
}

/// JSON shape of a metric, shared by ingestion payloads and snapshot files.
///
/// ```json
/// {"id": "PollCount", "type": "counter", "delta": 5, "hash": "..."}
/// {"id": "Alloc", "type": "gauge", "value": 1.1}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl From<&MetricRecord> for MetricPayload {
    fn from(record: &MetricRecord) -> Self {
        let (delta, value) = match record.value {
            MetricValue::Counter(v) => (Some(v), None),
            MetricValue::Gauge(v) => (None, Some(v)),
        };
        Self {
            id: record.name.clone(),
            kind: record.kind().as_str().to_string(),
            delta,
            value,
            hash: record.hash.clone(),
        }
    }
}

impl From<MetricRecord> for MetricPayload {
    fn from(record: MetricRecord) -> Self {
        MetricPayload::from(&record)
    }
}

/// Payload that cannot be turned into a [`MetricRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadError {
    UnknownKind(UnknownKindError),
    Value(ParseError),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::UnknownKind(e) => write!(f, "{}", e),
            PayloadError::Value(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PayloadError {}

impl TryFrom<MetricPayload> for MetricRecord {
    type Error = PayloadError;

    /// Takes the field matching the declared kind (`delta` for counters,
    /// `value` for gauges) and ignores the other one.
    fn try_from(payload: MetricPayload) -> Result<Self, Self::Error> {
        let kind: MetricKind = payload.kind.parse().map_err(PayloadError::UnknownKind)?;
        let value = match kind {
            MetricKind::Counter => payload.delta.map(MetricValue::Counter),
            MetricKind::Gauge => match payload.value {
                Some(v) if !v.is_finite() => {
                    return Err(PayloadError::Value(ParseError {
                        kind,
                        input: v.to_string(),
                    }));
                }
                v => v.map(MetricValue::Gauge),
            },
        }
        .ok_or(PayloadError::Value(ParseError::missing(kind)))?;

        Ok(MetricRecord {
            name: payload.id,
            value,
            hash: payload.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_payload_has_delta_only() {
        let record = MetricRecord::new("PollCount", MetricValue::Counter(5));
        let json = serde_json::to_string(&MetricPayload::from(&record)).unwrap();
        assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":5}"#);
    }

    #[test]
    fn gauge_payload_carries_hash_when_present() {
        let record = MetricRecord::new("Alloc", MetricValue::Gauge(1.5))
            .with_hash(Some("abcd".to_string()));
        let json = serde_json::to_string(&MetricPayload::from(record)).unwrap();
        assert_eq!(json, r#"{"id":"Alloc","type":"gauge","value":1.5,"hash":"abcd"}"#);
    }

    #[test]
    fn payload_decodes_into_record() {
        let payload: MetricPayload =
            serde_json::from_str(r#"{"id":"Alloc","type":"gauge","value":2.25}"#).unwrap();
        let record = MetricRecord::try_from(payload).unwrap();
        assert_eq!(record.name, "Alloc");
        assert_eq!(record.value, MetricValue::Gauge(2.25));
        assert_eq!(record.hash, None);
    }

    #[test]
    fn payload_without_matching_field_is_rejected() {
        let payload: MetricPayload =
            serde_json::from_str(r#"{"id":"X","type":"counter","value":2.0}"#).unwrap();
        let err = MetricRecord::try_from(payload).unwrap_err();
        assert_eq!(
            err,
            PayloadError::Value(ParseError::missing(MetricKind::Counter))
        );
    }

    #[test]
    fn payload_with_unknown_type_is_rejected() {
        let payload: MetricPayload =
            serde_json::from_str(r#"{"id":"X","type":"summary","delta":1}"#).unwrap();
        assert!(matches!(
            MetricRecord::try_from(payload),
            Err(PayloadError::UnknownKind(_))
        ));
    }

    #[test]
    fn negative_delta_fails_to_deserialize() {
        let res: Result<MetricPayload, _> =
            serde_json::from_str(r#"{"id":"X","type":"counter","delta":-1}"#);
        assert!(res.is_err());
    }
}
