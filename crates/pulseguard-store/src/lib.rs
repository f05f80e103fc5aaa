//! `pulseguard-store` – persistence for the PulseGuard runtime.
//!
//! A single SQLite database (WAL mode) backs four concerns, each exposed as
//! a cheaply cloneable handle over the shared connection:
//!
//! - [`ReadingRepository`] – append/range/recent over the time-series table.
//! - [`IdempotencyStore`] – keyed TTL set with atomic set-if-absent
//!   ([`MemoryIdempotencyStore`] for single-replica deployments,
//!   [`SqliteIdempotencyStore`] for a shared file).
//! - [`AlertStore`] – the `anomaly_alerts` audit table.
//! - [`RetrainLog`] – the `retrain_records` audit table.
//!
//! All blocking SQLite work runs on the blocking pool via
//! `tokio::task::spawn_blocking`; no caller ever holds the connection mutex
//! across an await point.
//!
//! # Timestamp encoding
//!
//! Timestamps are stored as RFC 3339 UTC text with *fixed* microsecond
//! precision (`2025-08-22T10:00:00.000000Z`) so that lexicographic order is
//! chronological order and the `(sensor_id, timestamp DESC)` index serves
//! range scans directly.

pub mod alerts;
pub mod idempotency;
pub mod readings;
pub mod retrain_log;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

pub use alerts::AlertStore;
pub use idempotency::{IdempotencyStore, MemoryIdempotencyStore, Reservation,
    SqliteIdempotencyStore};
pub use readings::{HourlyBucket, ReadingRepository, RetentionPolicy};
pub use retrain_log::RetrainLog;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors surfaced by the storage layer, pre-classified for the caller's
/// retry policy: [`StoreError::Transient`] is retryable, everything else is
/// not.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The natural key `(timestamp, sensor_id)` already exists.  Distinct
    /// from an idempotency duplicate: this is a collision on the row itself.
    #[error("duplicate natural key (timestamp, sensor_id)")]
    DuplicateKey,

    /// A reading referenced a sensor with no master record.
    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),

    /// Connection-level trouble (busy, locked, I/O).  Retry with backoff.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Constraint or schema failure that will not succeed on retry.
    #[error("permanent storage error: {0}")]
    Permanent(String),

    /// The idempotency backend could not answer.  The caller must fail the
    /// request rather than guess: an unknown key is never treated as a
    /// duplicate.
    #[error("idempotency backend unavailable: {0}")]
    Unavailable(String),

    /// A spawn_blocking task panicked.
    #[error("blocking task panicked: {0}")]
    TaskPanic(String),
}

impl StoreError {
    /// Whether the ingestion path may retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Map a rusqlite error onto the retry taxonomy.
///
/// Primary-key violations on `sensor_readings` become [`StoreError::DuplicateKey`];
/// foreign-key violations become [`StoreError::UnknownSensor`] (the caller
/// supplies the ID for the message); busy/locked become
/// [`StoreError::Transient`]; everything else is permanent.
pub(crate) fn classify(err: rusqlite::Error, sensor_id: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(ffi_err, _) => {
            use rusqlite::ffi;
            match ffi_err.extended_code {
                ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => {
                    StoreError::DuplicateKey
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    StoreError::UnknownSensor(sensor_id.to_string())
                }
                _ => match ffi_err.code {
                    ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked => {
                        StoreError::Transient(err.to_string())
                    }
                    _ => StoreError::Permanent(err.to_string()),
                },
            }
        }
        _ => StoreError::Permanent(err.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamp canonicalization
// ─────────────────────────────────────────────────────────────────────────────

/// Encode a timestamp in the canonical fixed-width column format.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a canonical timestamp column value.
pub(crate) fn decode_ts(text: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    text.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Database
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the SQLite connection.  Hand out per-concern handles with
/// [`Database::readings`], [`Database::alerts`], [`Database::retrain_log`],
/// and [`Database::idempotency`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and run schema migration.
    ///
    /// Enables WAL so readers are not blocked by the ingestion writer, and
    /// foreign keys so readings cannot outrun their sensor master rows.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Permanent(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StoreError::Permanent(e.to_string()))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a private in-memory database (tests, demo runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Permanent(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| StoreError::Permanent(e.to_string()))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sensors (
                sensor_id   TEXT NOT NULL PRIMARY KEY,
                sensor_type TEXT NOT NULL,
                location    TEXT,
                status      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sensor_readings (
                timestamp   TEXT NOT NULL,
                sensor_id   TEXT NOT NULL REFERENCES sensors(sensor_id),
                sensor_type TEXT NOT NULL,
                value       REAL NOT NULL,
                unit        TEXT,
                quality     REAL,
                metadata    TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (timestamp, sensor_id)
            );
            CREATE INDEX IF NOT EXISTS idx_readings_sensor_ts
                ON sensor_readings (sensor_id, timestamp DESC);
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key        TEXT NOT NULL PRIMARY KEY,
                event_id   TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS anomaly_alerts (
                id                  TEXT NOT NULL PRIMARY KEY,
                sensor_id           TEXT NOT NULL,
                kind                TEXT NOT NULL,
                severity            INTEGER NOT NULL,
                confidence          REAL NOT NULL,
                description         TEXT NOT NULL,
                evidence            TEXT NOT NULL DEFAULT '{}',
                recommended_actions TEXT NOT NULL DEFAULT '[]',
                status              TEXT NOT NULL,
                created_at          TEXT NOT NULL,
                updated_at          TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_sensor
                ON anomaly_alerts (sensor_id, created_at DESC);
            CREATE TABLE IF NOT EXISTS retrain_records (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                model_name            TEXT NOT NULL,
                triggered_by_event_id TEXT NOT NULL,
                started_at            TEXT NOT NULL,
                ended_at              TEXT,
                outcome               TEXT NOT NULL,
                new_version           INTEGER,
                reason_if_skipped     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_retrain_model
                ON retrain_records (model_name, started_at DESC);",
        )
        .map_err(|e| StoreError::Permanent(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Time-series repository handle.
    pub fn readings(&self) -> ReadingRepository {
        ReadingRepository::new(self.clone())
    }

    /// Alert audit-table handle.
    pub fn alerts(&self) -> AlertStore {
        AlertStore::new(self.clone())
    }

    /// Retrain audit-log handle.
    pub fn retrain_log(&self) -> RetrainLog {
        RetrainLog::new(self.clone())
    }

    /// Shared-store idempotency handle.
    pub fn idempotency(&self) -> SqliteIdempotencyStore {
        SqliteIdempotencyStore::new(self.clone())
    }

    /// Cheap liveness probe for the readiness endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| StoreError::Transient(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }
}
