use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{Backend, BackendError, BackendKind};
use crate::config::StoreConfig;
use crate::metric::{IntegrityKey, MetricPayload, MetricRecord};
use crate::store::{BatchError, MetricStore, NotFoundError, UpdateError};

/// Granularity of shutdown checks in the autosave loop.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// When snapshots are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// A background thread saves the full snapshot at this cadence.
    Periodic(Duration),
    /// Every accepted update is persisted before the call returns.
    Immediate,
}

impl SavePolicy {
    /// Zero interval means durability on every write. Database backends are
    /// always written per update; only the file backend batches.
    pub fn for_backend(store_interval: Duration, kind: BackendKind) -> Self {
        if store_interval.is_zero() || kind == BackendKind::Database {
            SavePolicy::Immediate
        } else {
            SavePolicy::Periodic(store_interval)
        }
    }
}

/// Startup failure of the storage manager.
#[derive(Debug)]
pub enum StartError {
    /// Restore was requested and the persisted snapshot could not be read.
    Restore(BackendError),
    /// The storage worker or autosave thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Restore(e) => write!(f, "failed to restore metrics: {}", e),
            StartError::Spawn(e) => write!(f, "failed to start storage threads: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

/// Failure of an ingestion call made through the manager.
#[derive(Debug)]
pub enum IngestError {
    /// The update was rejected; nothing changed.
    Rejected(UpdateError),
    /// A batch item was rejected; items before it were applied.
    Batch(BatchError),
    /// The update was applied in memory but could not be persisted.
    Persist {
        records: Vec<MetricRecord>,
        error: BackendError,
    },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Rejected(e) => write!(f, "{}", e),
            IngestError::Batch(e) => write!(f, "{}", e),
            IngestError::Persist { error, .. } => write!(f, "update applied but not saved: {}", error),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<UpdateError> for IngestError {
    fn from(e: UpdateError) -> Self {
        IngestError::Rejected(e)
    }
}

/// Backend calls that may wait for the I/O worker at once. Further calls
/// fail fast with [`BackendError::Timeout`] instead of piling up.
const IO_QUEUE_CAPACITY: usize = 64;

type IoJob = Box<dyn FnOnce() + Send>;

/// Single long-lived thread that runs every backend call of one manager.
///
/// Callers wait at most `timeout` for their result. A stalled backend holds
/// only this thread; once the queue is full new calls are refused at once.
#[derive(Clone)]
struct IoWorker {
    jobs: mpsc::SyncSender<IoJob>,
}

impl IoWorker {
    /// The worker exits once every handle is dropped and the queue drains.
    fn spawn() -> io::Result<Self> {
        let (jobs, queue) = mpsc::sync_channel::<IoJob>(IO_QUEUE_CAPACITY);
        thread::Builder::new()
            .name("metrics-storage-io".to_string())
            .spawn(move || {
                for job in queue {
                    job();
                }
                debug!("storage worker stopped");
            })?;
        Ok(Self { jobs })
    }

    fn run<T, F>(&self, timeout: Duration, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: IoJob = Box::new(move || {
            let _ = tx.send(f());
        });

        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("storage worker queue full, backend is not keeping up");
                return Err(BackendError::Timeout(timeout));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(BackendError::Io(io::Error::other("storage worker is gone")));
            }
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BackendError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::Io(io::Error::other(
                "storage worker exited without a result",
            ))),
        }
    }
}

/// Everything a save needs, cloneable into the autosave thread.
///
/// All backend calls go through one [`IoWorker`], so saves run in submission
/// order and each reads the store right before writing.
#[derive(Clone)]
struct Saver {
    store: Arc<MetricStore>,
    backend: Arc<dyn Backend>,
    io: IoWorker,
    io_timeout: Duration,
    last_saved: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Saver {
    fn mark_saved(&self) {
        *self.last_saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// Saves the full snapshot. Empty stores are not written.
    fn save_snapshot(&self) -> Result<usize, BackendError> {
        let this = self.clone();
        self.io.run(self.io_timeout, move || {
            let records = this.store.snapshot();
            if records.is_empty() {
                return Ok(0);
            }
            this.backend.save(&records)?;
            this.mark_saved();
            Ok(records.len())
        })
    }

    /// Saves the current state of the given names only. Valid for backends
    /// that upsert per name.
    fn save_names(&self, names: Vec<String>) -> Result<usize, BackendError> {
        let this = self.clone();
        self.io.run(self.io_timeout, move || {
            let records = this.store.snapshot_of(&names);
            if records.is_empty() {
                return Ok(0);
            }
            this.backend.save(&records)?;
            this.mark_saved();
            Ok(records.len())
        })
    }

    fn load(&self) -> Result<Vec<MetricRecord>, BackendError> {
        let backend = Arc::clone(&self.backend);
        self.io.run(self.io_timeout, move || backend.load())
    }

    fn health_check(&self) -> Result<(), BackendError> {
        let backend = Arc::clone(&self.backend);
        self.io.run(self.io_timeout, move || backend.health_check())
    }
}

/// Wires a [`MetricStore`] to a persistence [`Backend`].
///
/// - startup: restores persisted records when configured to
/// - [`SavePolicy::Periodic`]: a background thread saves the snapshot at the interval
/// - [`SavePolicy::Immediate`]: each accepted update is saved before returning
/// - [`StorageManager::shutdown`]: final flush, skipped for database backends
///
/// Every backend call is bounded by the configured I/O timeout.
pub struct StorageManager {
    saver: Saver,
    key: Option<IntegrityKey>,
    policy: SavePolicy,
    running: Arc<AtomicBool>,
    autosave: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    pub fn start(
        store: Arc<MetricStore>,
        backend: Arc<dyn Backend>,
        config: &StoreConfig,
    ) -> Result<Self, StartError> {
        let kind = backend.kind();
        let policy = SavePolicy::for_backend(config.store_interval, kind);
        let key = config.integrity_key();

        let saver = Saver {
            store,
            backend,
            io: IoWorker::spawn().map_err(StartError::Spawn)?,
            io_timeout: config.io_timeout,
            last_saved: Arc::new(Mutex::new(None)),
        };

        if config.restore {
            match saver.load() {
                Ok(records) => {
                    let restored = saver.store.restore(records, key.as_ref());
                    info!(records = restored, backend = %kind, "metrics restored");
                }
                Err(e) if e.is_not_found() => {
                    info!(backend = %kind, "no persisted metrics, starting empty");
                }
                Err(e) => {
                    error!(error = %e, backend = %kind, "restore failed");
                    return Err(StartError::Restore(e));
                }
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let autosave = match policy {
            SavePolicy::Periodic(interval) => Some(
                spawn_autosave(saver.clone(), interval, Arc::clone(&running))
                    .map_err(StartError::Spawn)?,
            ),
            SavePolicy::Immediate => None,
        };

        info!(backend = %kind, ?policy, signed = key.is_some(), "storage started");

        Ok(Self {
            saver,
            key,
            policy,
            running,
            autosave: Mutex::new(autosave),
        })
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.saver.store
    }

    pub fn policy(&self) -> SavePolicy {
        self.policy
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.saver.backend.kind()
    }

    /// Time of the last successful save.
    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        *self
            .saver
            .last_saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Plain-text update with the configured key.
    pub fn update(
        &self,
        name: &str,
        kind: &str,
        raw_value: &str,
        hash: Option<&str>,
    ) -> Result<MetricRecord, IngestError> {
        let record = self
            .saver
            .store
            .update(name, kind, raw_value, hash, self.key.as_ref())?;
        self.persist(vec![record])
            .map(|mut records| records.remove(0))
    }

    /// Structured (JSON-shaped) update with the configured key.
    pub fn update_record(&self, payload: MetricPayload) -> Result<MetricRecord, IngestError> {
        let record = self.saver.store.update_record(payload, self.key.as_ref())?;
        self.persist(vec![record])
            .map(|mut records| records.remove(0))
    }

    /// Batch update. Items before a rejected one stay applied and are persisted.
    pub fn update_batch(
        &self,
        payloads: Vec<MetricPayload>,
    ) -> Result<Vec<MetricRecord>, IngestError> {
        let names: Vec<String> = payloads.iter().map(|p| p.id.clone()).collect();

        match self.saver.store.update_batch(payloads, self.key.as_ref()) {
            Ok(records) => self.persist(records),
            Err(batch) => {
                if batch.index > 0 && self.policy == SavePolicy::Immediate {
                    let applied = names[..batch.index].to_vec();
                    if let Err(e) = self.save_changed(applied) {
                        error!(error = %e, "failed to save partially applied batch");
                    }
                }
                Err(IngestError::Batch(batch))
            }
        }
    }

    pub fn read(&self, name: &str, kind: &str) -> Result<MetricRecord, NotFoundError> {
        self.saver.store.read(name, kind)
    }

    pub fn snapshot(&self) -> Vec<MetricRecord> {
        self.saver.store.snapshot()
    }

    pub fn health_check(&self) -> Result<(), BackendError> {
        self.saver.health_check()
    }

    /// Saves the full snapshot now. Returns the number of records written.
    pub fn save_now(&self) -> Result<usize, BackendError> {
        self.saver.save_snapshot()
    }

    /// Stops autosave and writes a final snapshot, bounded by the I/O
    /// timeout. Database backends are already current and are not flushed.
    pub fn shutdown(&self) -> Result<(), BackendError> {
        self.stop_autosave();

        if self.backend_kind() == BackendKind::Database {
            info!("database storage is written per update, no final flush");
            return Ok(());
        }

        match self.saver.save_snapshot() {
            Ok(count) => {
                info!(records = count, "final snapshot saved");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "final snapshot failed");
                Err(e)
            }
        }
    }

    fn persist(&self, records: Vec<MetricRecord>) -> Result<Vec<MetricRecord>, IngestError> {
        if self.policy != SavePolicy::Immediate {
            return Ok(records);
        }

        let names = records.iter().map(|r| r.name.clone()).collect();
        match self.save_changed(names) {
            Ok(_) => Ok(records),
            Err(error) => {
                error!(error = %error, "failed to persist update");
                Err(IngestError::Persist { records, error })
            }
        }
    }

    fn save_changed(&self, names: Vec<String>) -> Result<usize, BackendError> {
        match self.backend_kind() {
            BackendKind::Database => self.saver.save_names(names),
            BackendKind::File => self.saver.save_snapshot(),
        }
    }

    fn stop_autosave(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("autosave thread panicked");
        }
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.stop_autosave();
    }
}

fn spawn_autosave(
    saver: Saver,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("metrics-autosave".to_string())
        .spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "autosave started");
            loop {
                let mut remaining = interval;
                while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
                    let step = remaining.min(STOP_CHECK_INTERVAL);
                    thread::sleep(step);
                    remaining = remaining.saturating_sub(step);
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match saver.save_snapshot() {
                    Ok(count) => debug!(records = count, "autosave completed"),
                    Err(e) => error!(error = %e, "autosave failed"),
                }
            }
            debug!("autosave stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricValue, compute_hash, canonical_string};
    use crate::storage::FileBackend;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::tempdir;

    /// In-memory backend: the file kind replaces everything on save, the
    /// database kind upserts per name.
    struct MemoryBackend {
        kind: BackendKind,
        rows: Mutex<BTreeMap<String, MetricRecord>>,
        attempts: AtomicUsize,
        saved_batches: Mutex<Vec<usize>>,
        fail_saves: AtomicBool,
        delay: Duration,
    }

    impl MemoryBackend {
        fn new(kind: BackendKind) -> Self {
            Self {
                kind,
                rows: Mutex::new(BTreeMap::new()),
                attempts: AtomicUsize::new(0),
                saved_batches: Mutex::new(Vec::new()),
                fail_saves: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn stored(&self, name: &str) -> Option<MetricValue> {
            self.rows.lock().unwrap().get(name).map(|r| r.value)
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Backend for MemoryBackend {
        fn save(&self, records: &[MetricRecord]) -> Result<(), BackendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(BackendError::Io(io::Error::other("disk full")));
            }
            let mut rows = self.rows.lock().unwrap();
            if self.kind == BackendKind::File {
                rows.clear();
            }
            for r in records {
                rows.insert(r.name.clone(), r.clone());
            }
            self.saved_batches.lock().unwrap().push(records.len());
            Ok(())
        }

        fn load(&self) -> Result<Vec<MetricRecord>, BackendError> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }

        fn health_check(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }
    }

    fn config(interval: Duration) -> StoreConfig {
        StoreConfig {
            store_interval: interval,
            restore: true,
            io_timeout: Duration::from_secs(2),
            ..StoreConfig::default()
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn policy_selection() {
        let file = BackendKind::File;
        let db = BackendKind::Database;
        assert_eq!(
            SavePolicy::for_backend(Duration::from_secs(10), file),
            SavePolicy::Periodic(Duration::from_secs(10))
        );
        assert_eq!(SavePolicy::for_backend(Duration::ZERO, file), SavePolicy::Immediate);
        assert_eq!(
            SavePolicy::for_backend(Duration::from_secs(10), db),
            SavePolicy::Immediate
        );
    }

    #[test]
    fn restarts_do_not_double_count_counters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let cfg = StoreConfig {
            store_file: path.clone(),
            ..config(Duration::from_secs(3600))
        };

        for (delta, expected) in [("5", 5), ("1", 6), ("4", 10)] {
            let backend = Arc::new(FileBackend::open(&path).unwrap());
            let manager =
                StorageManager::start(Arc::new(MetricStore::new()), backend, &cfg).unwrap();
            let record = manager.update("PollCount", "counter", delta, None).unwrap();
            assert_eq!(record.value, MetricValue::Counter(expected));
            manager.shutdown().unwrap();
        }
    }

    #[test]
    fn missing_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::open(dir.path().join("none.json")).unwrap());
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend,
            &config(Duration::from_secs(3600)),
        )
        .unwrap();
        assert!(manager.snapshot().is_empty());
    }

    #[test]
    fn corrupt_snapshot_fails_startup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "[{\"id\":").unwrap();

        let backend = Arc::new(FileBackend::open(&path).unwrap());
        let result = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend,
            &config(Duration::from_secs(3600)),
        );
        assert!(matches!(result, Err(StartError::Restore(_))));
    }

    #[test]
    fn restore_disabled_ignores_persisted_state() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        backend
            .save(&[MetricRecord::new("C", MetricValue::Counter(9))])
            .unwrap();

        let cfg = StoreConfig {
            restore: false,
            ..config(Duration::from_secs(3600))
        };
        let manager =
            StorageManager::start(Arc::new(MetricStore::new()), backend, &cfg).unwrap();
        assert!(manager.read("C", "counter").is_err());
    }

    #[test]
    fn zero_interval_saves_every_update() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::ZERO),
        )
        .unwrap();
        assert_eq!(manager.policy(), SavePolicy::Immediate);

        manager.update("A", "gauge", "1.5", None).unwrap();
        manager.update("B", "counter", "2", None).unwrap();
        assert_eq!(backend.attempts(), 2);
        assert_eq!(backend.stored("A"), Some(MetricValue::Gauge(1.5)));
        assert_eq!(backend.stored("B"), Some(MetricValue::Counter(2)));
        assert!(manager.last_saved().is_some());
    }

    #[test]
    fn database_backend_upserts_changed_names_and_skips_final_flush() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::Database));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::from_secs(3600)),
        )
        .unwrap();
        assert_eq!(manager.policy(), SavePolicy::Immediate);

        manager.update("A", "counter", "1", None).unwrap();
        manager.update("B", "counter", "1", None).unwrap();
        manager.update("A", "counter", "1", None).unwrap();
        assert_eq!(*backend.saved_batches.lock().unwrap(), vec![1, 1, 1]);
        assert_eq!(backend.stored("A"), Some(MetricValue::Counter(2)));

        manager.shutdown().unwrap();
        assert_eq!(backend.attempts(), 3);
    }

    #[test]
    fn periodic_autosave_writes_snapshot() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::from_millis(50)),
        )
        .unwrap();

        manager.update("Alloc", "gauge", "3.5", None).unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            backend.stored("Alloc") == Some(MetricValue::Gauge(3.5))
        }));
    }

    #[test]
    fn autosave_keeps_running_after_errors() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        backend.fail_saves.store(true, Ordering::SeqCst);
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::from_millis(20)),
        )
        .unwrap();
        manager.update("C", "counter", "1", None).unwrap();

        assert!(wait_until(Duration::from_secs(3), || backend.attempts() >= 3));
        backend.fail_saves.store(false, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(3), || backend.stored("C").is_some()));
    }

    #[test]
    fn shutdown_stops_autosave_and_flushes() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::from_secs(3600)),
        )
        .unwrap();
        manager.update("C", "counter", "7", None).unwrap();
        assert_eq!(backend.attempts(), 0);

        manager.shutdown().unwrap();
        assert_eq!(backend.stored("C"), Some(MetricValue::Counter(7)));
        assert!(manager.autosave.lock().unwrap().is_none());
    }

    #[test]
    fn failed_immediate_save_keeps_memory_state() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        backend.fail_saves.store(true, Ordering::SeqCst);
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::ZERO),
        )
        .unwrap();

        let err = manager.update("C", "counter", "4", None).unwrap_err();
        match err {
            IngestError::Persist { records, error } => {
                assert_eq!(records[0].value, MetricValue::Counter(4));
                assert!(matches!(error, BackendError::Io(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            manager.read("C", "counter").unwrap().value,
            MetricValue::Counter(4)
        );
    }

    #[test]
    fn rejected_update_is_not_saved() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::ZERO),
        )
        .unwrap();

        let err = manager.update("C", "counter", "x", None).unwrap_err();
        assert!(matches!(err, IngestError::Rejected(UpdateError::Parse(_))));
        assert_eq!(backend.attempts(), 0);
    }

    #[test]
    fn slow_backend_times_out() {
        let backend =
            Arc::new(MemoryBackend::new(BackendKind::File).with_delay(Duration::from_millis(500)));
        let cfg = StoreConfig {
            io_timeout: Duration::from_millis(50),
            ..config(Duration::from_secs(3600))
        };
        let manager =
            StorageManager::start(Arc::new(MetricStore::new()), backend, &cfg).unwrap();
        manager.update("C", "counter", "1", None).unwrap();

        let started = Instant::now();
        let err = manager.shutdown().unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[cfg(target_os = "linux")]
    fn live_threads() -> usize {
        std::fs::read_dir("/proc/self/task").unwrap().count()
    }

    #[test]
    fn stalled_backend_does_not_accumulate_threads() {
        let backend =
            Arc::new(MemoryBackend::new(BackendKind::File).with_delay(Duration::from_secs(30)));
        let cfg = StoreConfig {
            io_timeout: Duration::from_millis(20),
            ..config(Duration::ZERO)
        };
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &cfg,
        )
        .unwrap();

        #[cfg(target_os = "linux")]
        let before = live_threads();

        let mut failed = 0;
        for _ in 0..200 {
            match manager.update("C", "counter", "1", None) {
                Err(IngestError::Persist { error, .. }) => {
                    assert!(matches!(error, BackendError::Timeout(_)));
                    failed += 1;
                }
                other => panic!("unexpected result: {:?}", other.map(|r| r.value)),
            }
        }
        assert_eq!(failed, 200);

        // Only the first save reached the backend; the rest queued or were refused.
        assert_eq!(backend.attempts(), 1);
        assert_eq!(
            manager.read("C", "counter").unwrap().value,
            MetricValue::Counter(200)
        );

        // Parallel tests start threads too, so allow some slack.
        #[cfg(target_os = "linux")]
        assert!(live_threads() < before + 50);
    }

    #[test]
    fn full_io_queue_fails_fast() {
        let worker = IoWorker::spawn().unwrap();
        let (started_tx, started) = mpsc::channel();
        let (release, blocked) = mpsc::channel::<()>();
        worker
            .jobs
            .try_send(Box::new(move || {
                let _ = started_tx.send(());
                let _ = blocked.recv();
            }))
            .unwrap();
        started.recv().unwrap();

        for _ in 0..IO_QUEUE_CAPACITY {
            worker.jobs.try_send(Box::new(|| {})).unwrap();
        }

        let begun = Instant::now();
        let err = worker.run(Duration::from_secs(5), || Ok(())).unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(begun.elapsed() < Duration::from_secs(1));

        release.send(()).unwrap();
        assert!(worker.run(Duration::from_secs(5), || Ok(7)).is_ok());
    }

    #[test]
    fn signed_updates_use_configured_key() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        let cfg = StoreConfig {
            key: Some("k".to_string()),
            ..config(Duration::from_secs(3600))
        };
        let manager =
            StorageManager::start(Arc::new(MetricStore::new()), backend, &cfg).unwrap();
        let key = IntegrityKey::new("k");

        let value = MetricValue::Gauge(1.1);
        let hash = compute_hash(&canonical_string("Alloc", &value), Some(&key)).unwrap();
        manager.update("Alloc", "gauge", "1.1", Some(&hash)).unwrap();

        let err = manager
            .update("Alloc", "gauge", "2.2", Some(&hash))
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Rejected(UpdateError::Integrity { .. })
        ));
        assert_eq!(
            manager.read("Alloc", "gauge").unwrap().value,
            MetricValue::Gauge(1.1)
        );
    }

    #[test]
    fn partial_batch_is_persisted() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::Database));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::ZERO),
        )
        .unwrap();

        let payloads = vec![
            MetricPayload {
                id: "A".to_string(),
                kind: "counter".to_string(),
                delta: Some(3),
                value: None,
                hash: None,
            },
            MetricPayload {
                id: "B".to_string(),
                kind: "gauge".to_string(),
                delta: None,
                value: None,
                hash: None,
            },
        ];
        let err = manager.update_batch(payloads).unwrap_err();
        assert!(matches!(err, IngestError::Batch(BatchError { index: 1, .. })));
        assert_eq!(backend.stored("A"), Some(MetricValue::Counter(3)));
        assert_eq!(backend.stored("B"), None);
    }

    #[test]
    fn structured_update_goes_through_manager() {
        let backend = Arc::new(MemoryBackend::new(BackendKind::File));
        let manager = StorageManager::start(
            Arc::new(MetricStore::new()),
            backend.clone(),
            &config(Duration::ZERO),
        )
        .unwrap();

        let record = manager
            .update_record(MetricPayload {
                id: "RandomValue".to_string(),
                kind: "gauge".to_string(),
                delta: None,
                value: Some(0.75),
                hash: None,
            })
            .unwrap();
        assert_eq!(record.wire_text(), "0.750");
        assert_eq!(backend.stored("RandomValue"), Some(MetricValue::Gauge(0.75)));
        assert!(manager.health_check().is_ok());
    }
}
