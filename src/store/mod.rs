//! Concurrent in-memory metric store.
//!
//! The store maps metric names to their current [`MetricRecord`]. It is the
//! only mutable state of the collector; every write goes through
//! [`MetricStore::update`] (or its structured variants), which parses,
//! checks kind consistency, verifies the integrity hash, merges, and re-signs
//! the result in one step.
//!
//! Records live in a sharded [`DashMap`]. The read-check-merge-write sequence
//! for one name runs under that name's shard lock, so concurrent counter
//! deltas to the same name are never lost, while updates to unrelated names
//! proceed in parallel.

use std::fmt;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::metric::integrity::verify_canonical;
use crate::metric::{
    IntegrityKey, MetricKind, MetricPayload, MetricRecord, MetricValue, ParseError,
    PayloadError, UnknownKindError, canonical_string, sign,
};

/// Why an integrity check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// A key is configured but the payload carries no hash.
    Missing,
    /// The hash does not match the payload.
    Mismatch,
}

/// Rejected update. The stored metric is unchanged in every case.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateError {
    /// Metric name is empty.
    MissingName,
    /// Kind tag is neither `counter` nor `gauge`.
    UnknownKind(UnknownKindError),
    /// Value text does not parse for the kind.
    Parse(ParseError),
    /// Name is already bound to another kind.
    TypeMismatch {
        name: String,
        stored: MetricKind,
        requested: MetricKind,
    },
    /// Hash missing or wrong under a configured key.
    Integrity {
        name: String,
        failure: IntegrityFailure,
    },
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::MissingName => write!(f, "metric name is required"),
            UpdateError::UnknownKind(e) => write!(f, "{}", e),
            UpdateError::Parse(e) => write!(f, "{}", e),
            UpdateError::TypeMismatch {
                name,
                stored,
                requested,
            } => write!(
                f,
                "metric '{}' is a {}, cannot update it as {}",
                name, stored, requested
            ),
            UpdateError::Integrity { name, failure } => match failure {
                IntegrityFailure::Missing => write!(f, "metric '{}': hash is required", name),
                IntegrityFailure::Mismatch => write!(f, "metric '{}': wrong hash sum", name),
            },
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<ParseError> for UpdateError {
    fn from(e: ParseError) -> Self {
        UpdateError::Parse(e)
    }
}

impl From<UnknownKindError> for UpdateError {
    fn from(e: UnknownKindError) -> Self {
        UpdateError::UnknownKind(e)
    }
}

impl From<PayloadError> for UpdateError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::UnknownKind(e) => UpdateError::UnknownKind(e),
            PayloadError::Value(e) => UpdateError::Parse(e),
        }
    }
}

/// Failure of one element of a batch update.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchError {
    /// Position of the rejected payload. Earlier payloads were applied.
    pub index: usize,
    pub error: UpdateError,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch item {}: {}", self.index, self.error)
    }
}

impl std::error::Error for BatchError {}

/// Lookup of an unknown name, or of a known name under the wrong kind.
/// The two cases are reported identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFoundError {
    pub name: String,
    pub kind: String,
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value not found: {} '{}'", self.kind, self.name)
    }
}

impl std::error::Error for NotFoundError {}

#[derive(Debug, Default)]
pub struct MetricStore {
    metrics: DashMap<String, MetricRecord>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a plain-text update: `kind` is the literal tag and `raw_value`
    /// the value text. Returns the stored record after the merge, signed with
    /// `key` when one is configured.
    pub fn update(
        &self,
        name: &str,
        kind: &str,
        raw_value: &str,
        hash: Option<&str>,
        key: Option<&IntegrityKey>,
    ) -> Result<MetricRecord, UpdateError> {
        let kind: MetricKind = kind.parse()?;
        let value = MetricValue::parse(kind, raw_value)?;
        self.apply(name, value, hash, key)
    }

    /// Applies a structured (JSON-shaped) update.
    pub fn update_record(
        &self,
        payload: MetricPayload,
        key: Option<&IntegrityKey>,
    ) -> Result<MetricRecord, UpdateError> {
        let record = MetricRecord::try_from(payload)?;
        self.apply(&record.name, record.value, record.hash.as_deref(), key)
    }

    /// Applies payloads in order and stops at the first rejected one.
    pub fn update_batch(
        &self,
        payloads: Vec<MetricPayload>,
        key: Option<&IntegrityKey>,
    ) -> Result<Vec<MetricRecord>, BatchError> {
        let mut applied = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.into_iter().enumerate() {
            let record = self
                .update_record(payload, key)
                .map_err(|error| BatchError { index, error })?;
            applied.push(record);
        }
        Ok(applied)
    }

    fn apply(
        &self,
        name: &str,
        incoming: MetricValue,
        hash: Option<&str>,
        key: Option<&IntegrityKey>,
    ) -> Result<MetricRecord, UpdateError> {
        if name.is_empty() {
            return Err(UpdateError::MissingName);
        }

        match self.metrics.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().value;
                if current.kind() != incoming.kind() {
                    return Err(UpdateError::TypeMismatch {
                        name: name.to_string(),
                        stored: current.kind(),
                        requested: incoming.kind(),
                    });
                }
                check_integrity(name, &incoming, hash, key)?;

                let merged = current
                    .merge(incoming)
                    .ok_or_else(|| UpdateError::TypeMismatch {
                        name: name.to_string(),
                        stored: current.kind(),
                        requested: incoming.kind(),
                    })?;
                let record = sign(MetricRecord::new(name, merged), key);
                slot.insert(record.clone());
                debug!(name, kind = %merged.kind(), value = %merged.wire_text(), "metric updated");
                Ok(record)
            }
            Entry::Vacant(slot) => {
                check_integrity(name, &incoming, hash, key)?;

                let record = sign(MetricRecord::new(name, incoming), key);
                slot.insert(record.clone());
                debug!(name, kind = %incoming.kind(), value = %incoming.wire_text(), "metric created");
                Ok(record)
            }
        }
    }

    /// Returns the record for `name` if it exists with the given kind tag.
    pub fn read(&self, name: &str, kind: &str) -> Result<MetricRecord, NotFoundError> {
        let not_found = || NotFoundError {
            name: name.to_string(),
            kind: kind.to_string(),
        };

        let kind: MetricKind = kind.parse().map_err(|_| not_found())?;
        match self.metrics.get(name) {
            Some(record) if record.kind() == kind => Ok(record.value().clone()),
            _ => Err(not_found()),
        }
    }

    /// Copies every record, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .metrics
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Copies the records of the given names, sorted and deduplicated.
    /// Unknown names are skipped.
    pub fn snapshot_of(&self, names: &[String]) -> Vec<MetricRecord> {
        let mut names: Vec<&String> = names.iter().collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| self.metrics.get(name.as_str()).map(|r| r.value().clone()))
            .collect()
    }

    /// Installs previously persisted records as-is.
    ///
    /// Loaded counters are already accumulated totals, so they replace
    /// whatever is stored instead of being merged. Hashes are recomputed with
    /// the current key. Returns the number of records installed.
    pub fn restore(&self, records: Vec<MetricRecord>, key: Option<&IntegrityKey>) -> usize {
        let mut count = 0;
        for record in records {
            if record.name.is_empty() {
                warn!("skipping persisted metric without a name");
                continue;
            }
            let record = sign(record, key);
            self.metrics.insert(record.name.clone(), record);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

fn check_integrity(
    name: &str,
    incoming: &MetricValue,
    hash: Option<&str>,
    key: Option<&IntegrityKey>,
) -> Result<(), UpdateError> {
    let Some(key) = key else {
        return Ok(());
    };

    let failure = match hash {
        None => IntegrityFailure::Missing,
        Some(hash) if verify_canonical(&canonical_string(name, incoming), Some(hash), key) => {
            return Ok(());
        }
        Some(_) => IntegrityFailure::Mismatch,
    };

    warn!(name, ?failure, "rejected metric with invalid hash");
    Err(UpdateError::Integrity {
        name: name.to_string(),
        failure,
    })
}
