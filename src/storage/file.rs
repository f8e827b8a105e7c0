//! JSON snapshot file backend.
//!
//! The whole snapshot is one JSON array of records:
//! ```json
//! [{"id":"Alloc","type":"gauge","value":1.1},{"id":"PollCount","type":"counter","delta":5}]
//! ```
//! Each save writes a `.tmp` sibling and renames it over the live file, so a
//! failed write never truncates the previous snapshot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use super::{Backend, BackendError, BackendKind};
use crate::metric::{MetricPayload, MetricRecord};

pub struct FileBackend {
    path: PathBuf,
    /// Serializes writers sharing the `.tmp` path.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Creates the backend, making sure the parent directory exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Leftover from an interrupted save.
        let tmp = tmp_path(&path);
        if tmp.exists()
            && let Err(e) = fs::remove_file(&tmp)
        {
            warn!(path = %tmp.display(), error = %e, "failed to remove stale temp snapshot");
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Encodes records as the snapshot JSON array.
pub fn encode_snapshot(records: &[MetricRecord]) -> Result<Vec<u8>, BackendError> {
    let payloads: Vec<MetricPayload> = records.iter().map(MetricPayload::from).collect();
    Ok(serde_json::to_vec(&payloads)?)
}

/// Decodes a snapshot JSON array. Any invalid record fails the whole snapshot.
pub fn decode_snapshot(data: &[u8]) -> Result<Vec<MetricRecord>, BackendError> {
    let payloads: Vec<MetricPayload> = serde_json::from_slice(data)?;
    payloads
        .into_iter()
        .map(|p| {
            let id = p.id.clone();
            MetricRecord::try_from(p).map_err(|e| {
                BackendError::Serialization(format!("record '{}': {}", id, e))
            })
        })
        .collect()
}

impl Backend for FileBackend {
    fn save(&self, records: &[MetricRecord]) -> Result<(), BackendError> {
        let data = encode_snapshot(records)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tmp = tmp_path(&self.path);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), records = records.len(), "snapshot written");
        Ok(())
    }

    fn load(&self) -> Result<Vec<MetricRecord>, BackendError> {
        let data = fs::read(&self.path)?;
        decode_snapshot(&data)
    }

    fn health_check(&self) -> Result<(), BackendError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::metadata(dir)?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::File
    }
}
