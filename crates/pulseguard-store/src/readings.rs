//! Time-series repository over the `sensor_readings` table.
//!
//! # Storage layout
//!
//! | column      | type    | description                                |
//! |-------------|---------|--------------------------------------------|
//! | timestamp   | TEXT    | canonical RFC 3339 UTC, 6-digit micros     |
//! | sensor_id   | TEXT    | references `sensors(sensor_id)`            |
//! | sensor_type | TEXT    | snake_case [`SensorType`] name             |
//! | value       | REAL    | measurement                                |
//! | unit        | TEXT    | nullable                                   |
//! | quality     | REAL    | nullable, `[0, 1]`                         |
//! | metadata    | TEXT    | JSON object                                |
//!
//! Primary key `(timestamp, sensor_id)`; secondary index
//! `(sensor_id, timestamp DESC)` so `recent` over any window completes in
//! time proportional to the rows returned, not to the sensor's history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulseguard_types::{Sensor, SensorReading, SensorStatus, SensorType};

use crate::{classify, decode_ts, encode_ts, Database, StoreError};

/// Lifecycle knobs surfaced from the external store's policy.  `retention`
/// bounds [`ReadingRepository::apply_retention`]; `compress_after` is carried
/// as configuration only (compression belongs to the store, not this code).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub compress_after_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 180,
            compress_after_days: 7,
        }
    }
}

/// One row of the hourly rollup used by analytical readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub count: u64,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
}

/// Append, range-query, and recent-window reads over sensor readings.
#[derive(Clone)]
pub struct ReadingRepository {
    db: Database,
}

impl ReadingRepository {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert-ignore a sensor master record.  Returns `true` when the row
    /// was created, `false` when a record already existed (the existing row
    /// is left untouched).
    pub async fn bootstrap_sensor(&self, sensor: Sensor) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO sensors (sensor_id, sensor_type, location, status)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        sensor.sensor_id,
                        sensor.sensor_type.to_string(),
                        sensor.location,
                        sensor.status.to_string()
                    ],
                )
                .map_err(|e| classify(e, &sensor.sensor_id))?;
            Ok(inserted > 0)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Fetch a sensor master record.
    pub async fn get_sensor(&self, sensor_id: &str) -> Result<Option<Sensor>, StoreError> {
        let conn = self.db.conn();
        let sensor_id = sensor_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT sensor_id, sensor_type, location, status
                     FROM sensors WHERE sensor_id = ?1",
                )
                .map_err(|e| classify(e, &sensor_id))?;
            let mut rows = stmt
                .query(params![sensor_id])
                .map_err(|e| classify(e, &sensor_id))?;
            let Some(row) = rows.next().map_err(|e| classify(e, &sensor_id))? else {
                return Ok(None);
            };
            let type_str: String = row.get(1).map_err(|e| classify(e, &sensor_id))?;
            let status_str: String = row.get(3).map_err(|e| classify(e, &sensor_id))?;
            Ok(Some(Sensor {
                sensor_id: row.get(0).map_err(|e| classify(e, &sensor_id))?,
                sensor_type: type_str
                    .parse::<SensorType>()
                    .map_err(StoreError::Permanent)?,
                location: row.get(2).map_err(|e| classify(e, &sensor_id))?,
                status: status_str
                    .parse::<SensorStatus>()
                    .map_err(StoreError::Permanent)?,
            }))
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Append one reading.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicateKey`] when `(timestamp, sensor_id)` exists —
    ///   a deterministic collision on the natural key, distinct from an
    ///   idempotency duplicate.
    /// - [`StoreError::UnknownSensor`] when no master record exists.
    /// - [`StoreError::Transient`] on busy/locked; the ingestion path
    ///   retries these with backoff.
    pub async fn insert(&self, reading: &SensorReading) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let reading = reading.clone();
        tokio::task::spawn_blocking(move || {
            let metadata = serde_json::to_string(&reading.metadata)
                .map_err(|e| StoreError::Permanent(e.to_string()))?;
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO sensor_readings
                     (timestamp, sensor_id, sensor_type, value, unit, quality, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    encode_ts(reading.timestamp),
                    reading.sensor_id,
                    reading.sensor_type.to_string(),
                    reading.value,
                    reading.unit,
                    reading.quality,
                    metadata
                ],
            )
            .map_err(|e| classify(e, &reading.sensor_id))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Readings for `sensor_id` in `[from, to]`, ascending by timestamp,
    /// at most `limit` rows.  The sequence is finite and not restartable.
    pub async fn range(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SensorReading>, StoreError> {
        let conn = self.db.conn();
        let sensor_id = sensor_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT timestamp, sensor_id, sensor_type, value, unit, quality, metadata
                     FROM sensor_readings
                     WHERE sensor_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                     ORDER BY timestamp ASC
                     LIMIT ?4",
                )
                .map_err(|e| classify(e, &sensor_id))?;
            let rows = stmt
                .query_map(
                    params![sensor_id, encode_ts(from), encode_ts(to), limit as i64],
                    row_to_reading,
                )
                .map_err(|e| classify(e, &sensor_id))?;

            let mut readings = Vec::new();
            for row in rows {
                readings.push(row.map_err(|e| classify(e, &sensor_id))?);
            }
            Ok(readings)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Convenience over [`range`](Self::range): readings in the trailing
    /// `window` ending now.
    pub async fn recent(
        &self,
        sensor_id: &str,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<SensorReading>, StoreError> {
        let to = Utc::now();
        let from = to
            - chrono::Duration::from_std(window)
                .map_err(|e| StoreError::Permanent(e.to_string()))?;
        self.range(sensor_id, from, to, limit).await
    }

    /// Raw `value` column for a window, for statistical readers.  The end
    /// bound is exclusive when `end_inclusive` is false (reference windows)
    /// and inclusive otherwise (current windows).
    pub async fn values_range(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        end_inclusive: bool,
        cap: usize,
    ) -> Result<Vec<f64>, StoreError> {
        let conn = self.db.conn();
        let sensor_id = sensor_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let sql = if end_inclusive {
                "SELECT value FROM sensor_readings
                 WHERE sensor_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp ASC LIMIT ?4"
            } else {
                "SELECT value FROM sensor_readings
                 WHERE sensor_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
                 ORDER BY timestamp ASC LIMIT ?4"
            };
            let mut stmt = conn.prepare(sql).map_err(|e| classify(e, &sensor_id))?;
            let rows = stmt
                .query_map(
                    params![sensor_id, encode_ts(from), encode_ts(to), cap as i64],
                    |row| row.get::<_, f64>(0),
                )
                .map_err(|e| classify(e, &sensor_id))?;
            let mut values = Vec::new();
            for row in rows {
                values.push(row.map_err(|e| classify(e, &sensor_id))?);
            }
            Ok(values)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Hourly aggregate over `[from, to]` for analytical readers.  Never
    /// used by the ingestion path.
    pub async fn hourly_rollup(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyBucket>, StoreError> {
        let conn = self.db.conn();
        let sensor_id = sensor_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT strftime('%Y-%m-%dT%H:00:00.000000Z', timestamp) AS hour,
                            count(*), avg(value), min(value), max(value)
                     FROM sensor_readings
                     WHERE sensor_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                     GROUP BY hour
                     ORDER BY hour ASC",
                )
                .map_err(|e| classify(e, &sensor_id))?;
            let rows = stmt
                .query_map(
                    params![sensor_id, encode_ts(from), encode_ts(to)],
                    |row| {
                        let hour: String = row.get(0)?;
                        Ok((
                            hour,
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                        ))
                    },
                )
                .map_err(|e| classify(e, &sensor_id))?;
            let mut buckets = Vec::new();
            for row in rows {
                let (hour, count, avg, min, max) = row.map_err(|e| classify(e, &sensor_id))?;
                buckets.push(HourlyBucket {
                    hour_start: decode_ts(&hour).map_err(|e| classify(e, &sensor_id))?,
                    count: count as u64,
                    avg_value: avg,
                    min_value: min,
                    max_value: max,
                });
            }
            Ok(buckets)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Delete readings older than the policy's retention horizon.  Returns
    /// the number of rows removed.
    pub async fn apply_retention(&self, policy: RetentionPolicy) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let horizon = Utc::now() - chrono::Duration::days(i64::from(policy.retention_days));
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let removed = conn
                .execute(
                    "DELETE FROM sensor_readings WHERE timestamp < ?1",
                    params![encode_ts(horizon)],
                )
                .map_err(|e| classify(e, ""))?;
            if removed > 0 {
                debug!(removed, "retention sweep removed expired readings");
            }
            Ok(removed)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }
}

fn row_to_reading(row: &rusqlite::Row<'_>) -> rusqlite::Result<SensorReading> {
    let ts: String = row.get(0)?;
    let type_str: String = row.get(2)?;
    let metadata: String = row.get(6)?;
    Ok(SensorReading {
        timestamp: decode_ts(&ts)?,
        sensor_id: row.get(1)?,
        sensor_type: type_str.parse::<SensorType>().map_err(|e| {
            rusqlite::Error::InvalidColumnType(2, e, rusqlite::types::Type::Text)
        })?,
        value: row.get(3)?,
        unit: row.get(4)?,
        quality: row.get(5)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| {
            rusqlite::Error::InvalidColumnType(6, e.to_string(), rusqlite::types::Type::Text)
        })?,
    })
}
