//! metricsd - metric merge-and-persistence core of a metrics collector.
//!
//! Agents push counters and gauges; the collector merges them into a
//! concurrent store and persists snapshots. This library provides:
//! - `metric` - value kinds, merge rules, records, integrity hash
//! - `store` - concurrent metric store with type-safe updates
//! - `storage` - file and PostgreSQL backends, storage manager (restore/autosave/flush)
//! - `config` - storage configuration
//! - `util` - helper utilities
//!
//! Binaries:
//! - `metricsd` - collector storage daemon
//! - `metrics-dump` - inspect persisted snapshots

pub mod config;
pub mod metric;
pub mod storage;
pub mod store;
pub mod util;
