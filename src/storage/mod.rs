//! Persistence of metric snapshots.
//!
//! A [`Backend`] saves and loads whole snapshots. Two implementations exist:
//! - [`FileBackend`] - JSON array of records in a single file, replaced atomically
//! - [`DatabaseBackend`] - PostgreSQL table with one row per metric, upserted by name
//!
//! [`StorageManager`] ties a backend to a [`MetricStore`](crate::store::MetricStore):
//! restore at startup, periodic or per-update autosave, final flush on shutdown.

pub mod database;
pub mod file;
pub mod manager;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::metric::MetricRecord;

pub use database::DatabaseBackend;
pub use file::FileBackend;
pub use manager::{IngestError, SavePolicy, StartError, StorageManager};

/// Which kind of backend is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    File,
    Database,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::File => "file",
            BackendKind::Database => "database",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence failure. Never affects the in-memory store.
#[derive(Debug)]
pub enum BackendError {
    /// File system error.
    Io(io::Error),
    /// Snapshot content could not be encoded or decoded.
    Serialization(String),
    /// PostgreSQL connection or query error.
    Database(String),
    /// The backend did not answer within the bound.
    Timeout(Duration),
}

impl BackendError {
    /// True when the persisted snapshot simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Io(e) => write!(f, "storage I/O error: {}", e),
            BackendError::Serialization(msg) => write!(f, "storage format error: {}", msg),
            BackendError::Database(msg) => write!(f, "PostgreSQL: {}", msg),
            BackendError::Timeout(d) => {
                write!(f, "storage did not respond within {}ms", d.as_millis())
            }
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        BackendError::Io(e)
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Serialization(e.to_string())
    }
}

/// Storage for metric snapshots.
///
/// Implementations handle their own synchronization: the storage manager
/// may call `save` from several request threads and the autosave thread at once.
pub trait Backend: Send + Sync {
    /// Persists `records`, replacing the stored state of each name.
    fn save(&self, records: &[MetricRecord]) -> Result<(), BackendError>;

    /// Reads back every persisted record.
    fn load(&self) -> Result<Vec<MetricRecord>, BackendError>;

    /// Cheap reachability probe.
    fn health_check(&self) -> Result<(), BackendError>;

    fn kind(&self) -> BackendKind;
}

/// Opens the backend selected by `config`: PostgreSQL when a DSN is set,
/// the snapshot file otherwise.
pub fn open_backend(config: &StoreConfig) -> Result<Arc<dyn Backend>, BackendError> {
    match (config.backend_kind(), config.database_dsn.as_deref()) {
        (BackendKind::Database, Some(dsn)) => {
            Ok(Arc::new(DatabaseBackend::open(dsn, config.io_timeout)?))
        }
        _ => Ok(Arc::new(FileBackend::open(&config.store_file)?)),
    }
}
