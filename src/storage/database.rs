//! PostgreSQL backend.
//!
//! Metrics live in a single table with one row per metric name:
//!
//! | column          | type               |
//! |-----------------|--------------------|
//! | `id`            | `TEXT PRIMARY KEY` |
//! | `metric_type`   | `TEXT NOT NULL`    |
//! | `counter_value` | `BIGINT NULL`      |
//! | `gauge_value`   | `DOUBLE PRECISION NULL` |
//! | `hash`          | `TEXT NULL`        |
//!
//! Saves upsert by `id` inside one transaction, so repeated saves never
//! accumulate history. The connection is opened lazily, shared behind a
//! mutex, and dropped after any error so the next call reconnects.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use postgres::{Client, Config};
use postgres_native_tls::MakeTlsConnector;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, BackendKind};
use crate::metric::{MetricKind, MetricRecord, MetricValue};

pub(crate) const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    id TEXT PRIMARY KEY,
    metric_type TEXT NOT NULL,
    counter_value BIGINT,
    gauge_value DOUBLE PRECISION,
    hash TEXT
)";

pub(crate) const UPSERT_METRIC: &str = "INSERT INTO metrics (id, metric_type, counter_value, gauge_value, hash)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (id) DO UPDATE SET
    metric_type = EXCLUDED.metric_type,
    counter_value = EXCLUDED.counter_value,
    gauge_value = EXCLUDED.gauge_value,
    hash = EXCLUDED.hash";

pub(crate) const SELECT_METRICS: &str =
    "SELECT id, metric_type, counter_value, gauge_value, hash FROM metrics ORDER BY id";

pub struct DatabaseBackend {
    config: Config,
    tls: MakeTlsConnector,
    client: Mutex<Option<Client>>,
}

impl DatabaseBackend {
    /// Parses `dsn` (key/value or URL form) and prepares the TLS connector.
    /// No connection is made until the first call.
    pub fn open(dsn: &str, io_timeout: Duration) -> Result<Self, BackendError> {
        let config = build_config(dsn, io_timeout)?;
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| BackendError::Database(format!("TLS setup failed: {}", e)))?;

        Ok(Self {
            config,
            tls: MakeTlsConnector::new(connector),
            client: Mutex::new(None),
        })
    }

    fn connect(&self) -> Result<Client, BackendError> {
        self.config
            .connect(self.tls.clone())
            .map_err(|e| BackendError::Database(format_postgres_error(&e)))
    }

    fn connect_with_schema(&self) -> Result<Client, BackendError> {
        let mut client = self.connect()?;
        client
            .batch_execute(CREATE_TABLE)
            .map_err(|e| BackendError::Database(format_postgres_error(&e)))?;
        info!("PostgreSQL storage connected");
        Ok(client)
    }

    /// Runs `f` on the shared connection, reconnecting first if needed.
    /// A failed call discards the connection.
    fn with_client<T>(
        &self,
        f: impl FnOnce(&mut Client) -> Result<T, postgres::Error>,
    ) -> Result<T, BackendError> {
        let mut slot = self.client.lock().unwrap_or_else(PoisonError::into_inner);

        let mut client = match slot.take() {
            Some(client) if !client.is_closed() => client,
            _ => self.connect_with_schema()?,
        };

        match f(&mut client) {
            Ok(value) => {
                *slot = Some(client);
                Ok(value)
            }
            Err(e) => {
                let msg = format_postgres_error(&e);
                warn!(error = %msg, "PostgreSQL storage call failed, dropping connection");
                Err(BackendError::Database(msg))
            }
        }
    }
}

/// Builds the connection config with client- and server-side time bounds.
fn build_config(dsn: &str, io_timeout: Duration) -> Result<Config, BackendError> {
    let mut config: Config = dsn
        .parse()
        .map_err(|e: postgres::Error| BackendError::Database(format!("invalid DSN: {}", e)))?;

    config.connect_timeout(io_timeout);
    let statement_timeout = format!("-c statement_timeout={}", io_timeout.as_millis());
    let options = match config.get_options() {
        Some(existing) if !existing.is_empty() => format!("{} {}", existing, statement_timeout),
        _ => statement_timeout,
    };
    config.options(&options);
    Ok(config)
}

/// Column values for one record: `(counter_value, gauge_value)`.
fn value_columns(record: &MetricRecord) -> Result<(Option<i64>, Option<f64>), BackendError> {
    match record.value {
        MetricValue::Counter(v) => {
            let v = i64::try_from(v).map_err(|_| {
                BackendError::Serialization(format!(
                    "counter '{}' value {} exceeds BIGINT range",
                    record.name, v
                ))
            })?;
            Ok((Some(v), None))
        }
        MetricValue::Gauge(v) => Ok((None, Some(v))),
    }
}

/// Rebuilds a record from the columns of one row.
fn record_from_columns(
    id: String,
    metric_type: &str,
    counter_value: Option<i64>,
    gauge_value: Option<f64>,
    hash: Option<String>,
) -> Result<MetricRecord, BackendError> {
    let corrupt = |msg: String| BackendError::Serialization(format!("row '{}': {}", id, msg));

    let kind: MetricKind = metric_type.parse().map_err(|e| corrupt(format!("{}", e)))?;
    let value = match kind {
        MetricKind::Counter => {
            let v = counter_value.ok_or_else(|| corrupt("counter_value is NULL".into()))?;
            let v = u64::try_from(v).map_err(|_| corrupt(format!("negative counter {}", v)))?;
            MetricValue::Counter(v)
        }
        MetricKind::Gauge => {
            MetricValue::Gauge(gauge_value.ok_or_else(|| corrupt("gauge_value is NULL".into()))?)
        }
    };

    Ok(MetricRecord::new(id, value).with_hash(hash))
}

impl Backend for DatabaseBackend {
    fn save(&self, records: &[MetricRecord]) -> Result<(), BackendError> {
        if records.is_empty() {
            return Ok(());
        }

        let rows = records
            .iter()
            .map(|r| value_columns(r).map(|(c, g)| (r, c, g)))
            .collect::<Result<Vec<_>, _>>()?;

        self.with_client(|client| {
            let mut tx = client.transaction()?;
            let stmt = tx.prepare(UPSERT_METRIC)?;
            for (record, counter, gauge) in &rows {
                tx.execute(
                    &stmt,
                    &[
                        &record.name,
                        &record.kind().as_str(),
                        counter,
                        gauge,
                        &record.hash,
                    ],
                )?;
            }
            tx.commit()
        })?;

        debug!(records = records.len(), "metrics upserted");
        Ok(())
    }

    fn load(&self) -> Result<Vec<MetricRecord>, BackendError> {
        let rows = self.with_client(|client| client.query(SELECT_METRICS, &[]))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let read = |e: postgres::Error| BackendError::Database(format_postgres_error(&e));
            let id: String = row.try_get(0).map_err(read)?;
            let metric_type: String = row.try_get(1).map_err(read)?;
            let counter_value: Option<i64> = row.try_get(2).map_err(read)?;
            let gauge_value: Option<f64> = row.try_get(3).map_err(read)?;
            let hash: Option<String> = row.try_get(4).map_err(read)?;
            records.push(record_from_columns(
                id,
                &metric_type,
                counter_value,
                gauge_value,
                hash,
            )?);
        }
        Ok(records)
    }

    /// Opens and closes a fresh connection; no query is run.
    fn health_check(&self) -> Result<(), BackendError> {
        let client = self.connect()?;
        client
            .close()
            .map_err(|e| BackendError::Database(format_postgres_error(&e)))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Database
    }
}

/// Condenses a PostgreSQL error into a short operator-facing message.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("timed out") {
            "connection timed out".to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_targets_primary_key() {
        assert!(UPSERT_METRIC.contains("ON CONFLICT (id) DO UPDATE"));
        assert!(UPSERT_METRIC.contains("counter_value = EXCLUDED.counter_value"));
        assert!(CREATE_TABLE.contains("id TEXT PRIMARY KEY"));
        assert!(SELECT_METRICS.starts_with("SELECT id, metric_type, counter_value, gauge_value, hash"));
    }

    #[test]
    fn config_carries_time_bounds() {
        let config = build_config("host=localhost user=metrics", Duration::from_secs(3)).unwrap();
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(3)));
        assert_eq!(config.get_options(), Some("-c statement_timeout=3000"));
    }

    #[test]
    fn config_keeps_existing_options() {
        let config = build_config(
            "postgres://metrics@localhost/metrics?options=-c%20search_path%3Dapp",
            Duration::from_millis(1500),
        )
        .unwrap();
        assert_eq!(
            config.get_options(),
            Some("-c search_path=app -c statement_timeout=1500")
        );
    }

    #[test]
    fn invalid_dsn_is_rejected() {
        assert!(matches!(
            build_config("port=notaport", Duration::from_secs(1)),
            Err(BackendError::Database(_))
        ));
    }

    #[test]
    fn value_columns_split_by_kind() {
        let counter = MetricRecord::new("c", MetricValue::Counter(9));
        assert_eq!(value_columns(&counter).unwrap(), (Some(9), None));

        let gauge = MetricRecord::new("g", MetricValue::Gauge(0.5));
        assert_eq!(value_columns(&gauge).unwrap(), (None, Some(0.5)));

        let huge = MetricRecord::new("h", MetricValue::Counter(u64::MAX));
        assert!(matches!(
            value_columns(&huge),
            Err(BackendError::Serialization(_))
        ));
    }

    #[test]
    fn rows_map_back_to_records() {
        let counter =
            record_from_columns("PollCount".into(), "counter", Some(42), None, None).unwrap();
        assert_eq!(counter.value, MetricValue::Counter(42));

        let gauge = record_from_columns(
            "Alloc".into(),
            "gauge",
            None,
            Some(1.25),
            Some("ff".into()),
        )
        .unwrap();
        assert_eq!(gauge.value, MetricValue::Gauge(1.25));
        assert_eq!(gauge.hash.as_deref(), Some("ff"));
    }

    #[test]
    fn corrupt_rows_are_rejected() {
        assert!(record_from_columns("x".into(), "counter", None, Some(1.0), None).is_err());
        assert!(record_from_columns("x".into(), "counter", Some(-1), None, None).is_err());
        assert!(record_from_columns("x".into(), "gauge", Some(1), None, None).is_err());
        let err = record_from_columns("x".into(), "meter", Some(1), None, None).unwrap_err();
        assert!(err.to_string().contains("row 'x'"));
    }
}
