//! Collector storage configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::metric::IntegrityKey;
use crate::storage::BackendKind;

/// Default snapshot file, used when neither a file nor a database is configured.
pub const DEFAULT_STORE_FILE: &str = "/tmp/devops-metrics-db.json";

/// Default autosave cadence.
pub const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);

/// Default bound on a single backend round trip.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Autosave cadence. Zero means save after every accepted update.
    pub store_interval: Duration,
    /// Snapshot file of the file backend.
    pub store_file: PathBuf,
    /// Load persisted metrics at startup.
    pub restore: bool,
    /// Pre-shared key for payload hashes. `None` or empty disables signing.
    pub key: Option<String>,
    /// PostgreSQL connection string. Selects the database backend when set.
    pub database_dsn: Option<String>,
    /// Upper bound for one save, load or health probe.
    pub io_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_interval: DEFAULT_STORE_INTERVAL,
            store_file: PathBuf::from(DEFAULT_STORE_FILE),
            restore: true,
            key: None,
            database_dsn: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl StoreConfig {
    pub fn integrity_key(&self) -> Option<IntegrityKey> {
        IntegrityKey::from_config(self.key.as_deref())
    }

    /// Backend selected by this configuration.
    pub fn backend_kind(&self) -> BackendKind {
        match self.database_dsn.as_deref() {
            Some(dsn) if !dsn.trim().is_empty() => BackendKind::Database,
            _ => BackendKind::File,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_file_backend() {
        let config = StoreConfig::default();
        assert_eq!(config.backend_kind(), BackendKind::File);
        assert_eq!(config.store_interval, Duration::from_secs(300));
        assert!(config.restore);
        assert!(config.integrity_key().is_none());
    }

    #[test]
    fn dsn_selects_database_backend() {
        let config = StoreConfig {
            database_dsn: Some("host=localhost user=metrics".to_string()),
            ..StoreConfig::default()
        };
        assert_eq!(config.backend_kind(), BackendKind::Database);

        let blank = StoreConfig {
            database_dsn: Some("  ".to_string()),
            ..StoreConfig::default()
        };
        assert_eq!(blank.backend_kind(), BackendKind::File);
    }

    #[test]
    fn empty_key_means_unsigned() {
        let config = StoreConfig {
            key: Some(String::new()),
            ..StoreConfig::default()
        };
        assert!(config.integrity_key().is_none());
    }
}
