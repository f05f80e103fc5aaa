//! The `retrain_records` audit table.
//!
//! One row per retrain attempt, whatever the outcome.  The retrain agent's
//! cooldown gate reads [`RetrainLog::last_completed`] so the interval
//! survives process restarts.

use rusqlite::params;
use uuid::Uuid;

use pulseguard_types::{RetrainOutcome, RetrainRecord};

use crate::{classify, decode_ts, encode_ts, Database, StoreError};

/// Persistence handle for retrain audit rows.
#[derive(Clone)]
pub struct RetrainLog {
    db: Database,
}

impl RetrainLog {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one attempt record.
    pub async fn record(&self, record: &RetrainRecord) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO retrain_records
                     (model_name, triggered_by_event_id, started_at, ended_at,
                      outcome, new_version, reason_if_skipped)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.model_name,
                    record.triggered_by_event_id.to_string(),
                    encode_ts(record.started_at),
                    record.ended_at.map(encode_ts),
                    record.outcome.to_string(),
                    record.new_version,
                    record.reason_if_skipped,
                ],
            )
            .map_err(|e| classify(e, ""))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// The most recent *finished* attempt for `model_name` — skips rows that
    /// were themselves skips, since only real attempts arm the cooldown.
    pub async fn last_completed(
        &self,
        model_name: &str,
    ) -> Result<Option<RetrainRecord>, StoreError> {
        let conn = self.db.conn();
        let model_name = model_name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT model_name, triggered_by_event_id, started_at, ended_at,
                            outcome, new_version, reason_if_skipped
                     FROM retrain_records
                     WHERE model_name = ?1 AND outcome != 'skipped' AND ended_at IS NOT NULL
                     ORDER BY ended_at DESC
                     LIMIT 1",
                )
                .map_err(|e| classify(e, ""))?;
            let mut rows = stmt
                .query(params![model_name])
                .map_err(|e| classify(e, ""))?;
            match rows.next().map_err(|e| classify(e, ""))? {
                Some(row) => Ok(Some(row_to_record(row).map_err(|e| classify(e, ""))?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Attempt history for one model, newest first.
    pub async fn list(
        &self,
        model_name: &str,
        limit: usize,
    ) -> Result<Vec<RetrainRecord>, StoreError> {
        let conn = self.db.conn();
        let model_name = model_name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT model_name, triggered_by_event_id, started_at, ended_at,
                            outcome, new_version, reason_if_skipped
                     FROM retrain_records
                     WHERE model_name = ?1
                     ORDER BY started_at DESC
                     LIMIT ?2",
                )
                .map_err(|e| classify(e, ""))?;
            let rows = stmt
                .query_map(params![model_name, limit as i64], row_to_record)
                .map_err(|e| classify(e, ""))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|e| classify(e, ""))?);
            }
            Ok(records)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetrainRecord> {
    let event_id: String = row.get(1)?;
    let started: String = row.get(2)?;
    let ended: Option<String> = row.get(3)?;
    let outcome: String = row.get(4)?;
    let version: Option<i64> = row.get(5)?;
    Ok(RetrainRecord {
        model_name: row.get(0)?,
        triggered_by_event_id: Uuid::parse_str(&event_id).map_err(|e| {
            rusqlite::Error::InvalidColumnType(1, e.to_string(), rusqlite::types::Type::Text)
        })?,
        started_at: decode_ts(&started)?,
        ended_at: ended.as_deref().map(decode_ts).transpose()?,
        outcome: outcome.parse::<RetrainOutcome>().map_err(|e| {
            rusqlite::Error::InvalidColumnType(4, e, rusqlite::types::Type::Text)
        })?,
        new_version: version.map(|v| v as u32),
        reason_if_skipped: row.get(6)?,
    })
}
