//! metricsd - metrics collector storage daemon.
//!
//! Hosts the metric store and its persistence: restores the last snapshot,
//! autosaves on the configured cadence, and flushes once more on shutdown.
//! Ingestion front-ends embed the library and call into the same manager.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use metricsd::config::{DEFAULT_STORE_FILE, StoreConfig};
use metricsd::storage::{StorageManager, open_backend};
use metricsd::store::MetricStore;
use metricsd::util::parse_duration;

/// Metrics collector storage daemon.
#[derive(Parser)]
#[command(name = "metricsd", about = "Metrics collector storage daemon", version)]
struct Args {
    /// Autosave interval (e.g. "300s", "5m"). 0 saves after every update.
    #[arg(short = 'i', long, env = "STORE_INTERVAL", default_value = "300s", value_parser = parse_duration)]
    store_interval: Duration,

    /// Snapshot file used when no database is configured.
    #[arg(short = 'f', long, env = "STORE_FILE", default_value = DEFAULT_STORE_FILE)]
    store_file: PathBuf,

    /// Restore persisted metrics at startup.
    #[arg(short = 'r', long, env = "RESTORE", default_value_t = true, action = clap::ArgAction::Set)]
    restore: bool,

    /// Pre-shared key for payload hashes. Unset or empty disables signing.
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    key: Option<String>,

    /// PostgreSQL connection string. Selects database storage when set.
    #[arg(short = 'd', long, env = "DATABASE_DSN", hide_env_values = true)]
    database_dsn: Option<String>,

    /// Upper bound for one storage round trip, also the shutdown grace period.
    #[arg(long, env = "IO_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    io_timeout: Duration,

    /// Interval between storage health probes.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    health_interval: Duration,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            store_interval: self.store_interval,
            store_file: self.store_file.clone(),
            restore: self.restore,
            key: self.key.clone(),
            database_dsn: self.database_dsn.clone(),
            io_timeout: self.io_timeout,
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("metricsd={}", level).parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = args.store_config();

    info!("metricsd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: backend={}, store_interval={}ms, restore={}, io_timeout={}ms, signed={}",
        config.backend_kind(),
        config.store_interval.as_millis(),
        config.restore,
        config.io_timeout.as_millis(),
        config.integrity_key().is_some()
    );

    let backend = match open_backend(&config) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(MetricStore::new());
    let manager = match StorageManager::start(store, backend, &config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    match manager.health_check() {
        Ok(()) => info!("Storage healthy ({} metrics loaded)", manager.store().len()),
        Err(e) => warn!("Storage unhealthy: {}", e),
    }

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut last_probe = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));

        if last_probe.elapsed() >= args.health_interval {
            last_probe = Instant::now();
            match manager.health_check() {
                Ok(()) => debug!(
                    metrics = manager.store().len(),
                    last_saved = ?manager.last_saved(),
                    "storage healthy"
                ),
                Err(e) => warn!("Storage unhealthy: {}", e),
            }
        }
    }

    info!("Shutting down...");
    let flushed = manager.shutdown();
    drop(manager);

    match flushed {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => {
            error!("Final flush failed, recent updates may be lost: {}", e);
            std::process::exit(1);
        }
    }
}
