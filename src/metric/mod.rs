//! Metric data model: value kinds, records, and the integrity hash.

pub mod integrity;
mod record;
mod value;

pub use integrity::{IntegrityKey, canonical_string, compute_hash, sign, verify_hash};
pub use record::{MetricPayload, MetricRecord, PayloadError};
pub use value::{
    MetricKind, MetricValue, ParseError, UnknownKindError, merge_counter, merge_gauge,
};
