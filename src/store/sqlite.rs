//! SQLite-backed store.
//!
//! Every breaker update runs in a `BEGIN IMMEDIATE` transaction, which takes
//! the database write lock before the row is read. Any number of processes
//! can share the file; their updates to a row serialize on that lock, and
//! `busy_timeout` makes waiters queue instead of failing.

use super::{BreakerStore, ErrorLogSink, StoreError};
use crate::resilience::breaker::{
    apply_event, BreakerEvent, BreakerRecord, BreakerSettings, CircuitState, Transition,
};
use crate::resilience::classifier::ErrorSeverity;
use crate::resilience::logger::ErrorLogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, useful for testing
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Each connection would get its own database; keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS circuit_breaker_state (
    endpoint TEXT PRIMARY KEY NOT NULL,
    state TEXT NOT NULL,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    failure_threshold INTEGER NOT NULL,
    timeout_ms INTEGER NOT NULL,
    opened_at TEXT,
    last_failure_at TEXT,
    last_success_at TEXT,
    trial_started_at TEXT,
    updated_at TEXT NOT NULL
)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS error_log (
    id TEXT PRIMARY KEY NOT NULL,
    endpoint TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    will_retry INTEGER NOT NULL,
    timestamp TEXT NOT NULL
)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
CREATE INDEX IF NOT EXISTS idx_error_log_endpoint_ts
ON error_log(endpoint, timestamp)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn fetch_record(
        conn: &mut SqliteConnection,
        endpoint: &str,
    ) -> Result<Option<BreakerRecord>, StoreError> {
        let row = sqlx::query(
            r#"
SELECT endpoint, state, consecutive_failures, failure_threshold, timeout_ms,
       opened_at, last_failure_at, last_success_at, trial_started_at
FROM circuit_breaker_state
WHERE endpoint = ?
            "#,
        )
        .bind(endpoint)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn write_record(
        conn: &mut SqliteConnection,
        record: &BreakerRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO circuit_breaker_state (
    endpoint, state, consecutive_failures, failure_threshold, timeout_ms,
    opened_at, last_failure_at, last_success_at, trial_started_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(endpoint) DO UPDATE SET
    state = excluded.state,
    consecutive_failures = excluded.consecutive_failures,
    failure_threshold = excluded.failure_threshold,
    timeout_ms = excluded.timeout_ms,
    opened_at = excluded.opened_at,
    last_failure_at = excluded.last_failure_at,
    last_success_at = excluded.last_success_at,
    trial_started_at = excluded.trial_started_at,
    updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.endpoint)
        .bind(record.state.as_str())
        .bind(i64::from(record.consecutive_failures))
        .bind(i64::from(record.failure_threshold))
        .bind(i64::try_from(record.timeout_ms).unwrap_or(i64::MAX))
        .bind(record.opened_at)
        .bind(record.last_failure_at)
        .bind(record.last_success_at)
        .bind(record.trial_started_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<BreakerRecord, StoreError> {
    let state: String = row.try_get("state")?;
    let state = CircuitState::from_str(&state).map_err(StoreError::Corrupt)?;
    let count = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
    };
    let timeout_ms: i64 = row.try_get("timeout_ms")?;

    Ok(BreakerRecord {
        endpoint: row.try_get("endpoint")?,
        state,
        consecutive_failures: count("consecutive_failures")?,
        failure_threshold: count("failure_threshold")?,
        timeout_ms: u64::try_from(timeout_ms)
            .map_err(|_| StoreError::Corrupt(format!("negative timeout_ms: {}", timeout_ms)))?,
        opened_at: row.try_get("opened_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        last_success_at: row.try_get("last_success_at")?,
        trial_started_at: row.try_get("trial_started_at")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<ErrorLogEntry, StoreError> {
    let id: String = row.try_get("id")?;
    let severity: String = row.try_get("severity")?;
    Ok(ErrorLogEntry {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("bad id {}: {}", id, e)))?,
        endpoint: row.try_get("endpoint")?,
        error_kind: row.try_get("error_kind")?,
        severity: ErrorSeverity::from_str(&severity).map_err(StoreError::Corrupt)?,
        message: row.try_get("message")?,
        will_retry: row.try_get("will_retry")?,
        timestamp: row.try_get("timestamp")?,
    })
}

#[async_trait]
impl BreakerStore for SqliteStore {
    async fn load(&self, endpoint: &str) -> Result<Option<BreakerRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_record(&mut conn, endpoint).await
    }

    async fn apply(
        &self,
        endpoint: &str,
        event: BreakerEvent,
        settings: &BreakerSettings,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let current = Self::fetch_record(&mut tx, endpoint).await?;
        let transition = apply_event(current, endpoint, event, settings, now);
        if transition.changed {
            Self::write_record(&mut tx, &transition.record, now).await?;
        }

        tx.commit().await?;
        Ok(transition)
    }

    async fn list(&self) -> Result<Vec<BreakerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT endpoint, state, consecutive_failures, failure_threshold, timeout_ms,
       opened_at, last_failure_at, last_success_at, trial_started_at
FROM circuit_breaker_state
ORDER BY endpoint
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl ErrorLogSink for SqliteStore {
    async fn append(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO error_log (id, endpoint, error_kind, severity, message, will_retry, timestamp) ",
        );
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(entry.id.to_string())
                .push_bind(&entry.endpoint)
                .push_bind(&entry.error_kind)
                .push_bind(entry.severity.as_str())
                .push_bind(&entry.message)
                .push_bind(entry.will_retry)
                .push_bind(entry.timestamp);
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn recent(&self, endpoint: Option<&str>, limit: usize) -> Result<Vec<ErrorLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT id, endpoint, error_kind, severity, message, will_retry, timestamp
FROM error_log
WHERE ?1 IS NULL OR endpoint = ?1
ORDER BY timestamp DESC, rowid DESC
LIMIT ?2
            "#,
        )
        .bind(endpoint)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }
}
