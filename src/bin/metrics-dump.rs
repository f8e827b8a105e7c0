use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use metricsd::config::DEFAULT_STORE_FILE;
use metricsd::metric::{IntegrityKey, MetricKind, MetricPayload, MetricRecord, verify_hash};
use metricsd::storage::file::decode_snapshot;
use metricsd::storage::{Backend, BackendError, DatabaseBackend};
use metricsd::util::parse_duration;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "metrics-dump", about = "Inspect persisted metric snapshots")]
struct Cli {
    /// Snapshot file to read
    #[arg(default_value = DEFAULT_STORE_FILE)]
    path: PathBuf,

    /// Read from PostgreSQL instead of a file
    #[arg(short = 'd', long, env = "DATABASE_DSN", hide_env_values = true)]
    database_dsn: Option<String>,

    /// Verify record hashes with this key
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    key: Option<String>,

    /// Only show metrics of this type (counter or gauge)
    #[arg(short = 't', long = "type")]
    kind: Option<MetricKind>,

    /// Timeout for database connections
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    timeout: Duration,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();

    let records = match load(&cli) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("Failed to read metrics: {}", e);
            std::process::exit(1);
        }
    };

    let key = IntegrityKey::from_config(cli.key.as_deref());
    let rows: Vec<DumpRow> = records
        .into_iter()
        .filter(|r| cli.kind.is_none_or(|k| r.kind() == k))
        .map(|r| DumpRow::new(r, key.as_ref()))
        .collect();

    if cli.json {
        match serde_json::to_string_pretty(&rows) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Failed to encode JSON: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", render_table(&rows));
    }

    if rows.iter().any(|r| r.verified == Some(false)) {
        std::process::exit(2);
    }
}

fn load(cli: &Cli) -> Result<Vec<MetricRecord>, BackendError> {
    match cli.database_dsn.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(dsn) => DatabaseBackend::open(dsn, cli.timeout)?.load(),
        // Read-only: opening a FileBackend would clear a live daemon's temp file.
        None => decode_snapshot(&std::fs::read(&cli.path)?),
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DumpRow {
    #[serde(flatten)]
    payload: MetricPayload,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<bool>,
}

impl DumpRow {
    fn new(record: MetricRecord, key: Option<&IntegrityKey>) -> Self {
        Self {
            verified: key.map(|k| verify_hash(&record, k)),
            text: record.wire_text(),
            payload: MetricPayload::from(record),
        }
    }
}

fn render_table(rows: &[DumpRow]) -> String {
    let name_width = rows
        .iter()
        .map(|r| r.payload.id.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = format!("{:<name_width$}  {:<7}  {:>20}  HASH\n", "NAME", "TYPE", "VALUE");
    for row in rows {
        let hash = match row.verified {
            Some(true) => "ok",
            Some(false) => "MISMATCH",
            None if row.payload.hash.is_some() => "present",
            None => "-",
        };
        out.push_str(&format!(
            "{:<name_width$}  {:<7}  {:>20}  {}\n",
            row.payload.id, row.payload.kind, row.text, hash
        ));
    }
    out.push_str(&format!("{} metrics\n", rows.len()));
    out
}
