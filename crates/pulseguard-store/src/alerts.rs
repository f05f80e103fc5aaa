//! The `anomaly_alerts` audit table.
//!
//! Alerts are persisted with status `open` before the first dispatch attempt
//! so that delivery failure never loses the finding; triage transitions
//! arrive later through [`AlertStore::update_status`].

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use pulseguard_types::{AlertStatus, AnomalyAlert};

use crate::{classify, decode_ts, encode_ts, Database, StoreError};

/// Persistence handle for anomaly alerts.
#[derive(Clone)]
pub struct AlertStore {
    db: Database,
}

impl AlertStore {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new alert row.
    pub async fn insert(&self, alert: &AnomalyAlert) -> Result<(), StoreError> {
        let conn = self.db.conn();
        let alert = alert.clone();
        tokio::task::spawn_blocking(move || {
            let evidence = serde_json::to_string(&alert.evidence)
                .map_err(|e| StoreError::Permanent(e.to_string()))?;
            let actions = serde_json::to_string(&alert.recommended_actions)
                .map_err(|e| StoreError::Permanent(e.to_string()))?;
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO anomaly_alerts
                     (id, sensor_id, kind, severity, confidence, description,
                      evidence, recommended_actions, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    alert.id.to_string(),
                    alert.sensor_id,
                    alert.kind,
                    i64::from(alert.severity),
                    alert.confidence,
                    alert.description,
                    evidence,
                    actions,
                    alert.status.to_string(),
                    encode_ts(alert.created_at),
                    alert.updated_at.map(encode_ts),
                ],
            )
            .map_err(|e| classify(e, &alert.sensor_id))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Fetch one alert by ID.
    pub async fn get(&self, id: Uuid) -> Result<Option<AnomalyAlert>, StoreError> {
        let conn = self.db.conn();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT id, sensor_id, kind, severity, confidence, description,
                            evidence, recommended_actions, status, created_at, updated_at
                     FROM anomaly_alerts WHERE id = ?1",
                )
                .map_err(|e| classify(e, ""))?;
            let mut rows = stmt
                .query(params![id.to_string()])
                .map_err(|e| classify(e, ""))?;
            match rows.next().map_err(|e| classify(e, ""))? {
                Some(row) => Ok(Some(row_to_alert(row).map_err(|e| classify(e, ""))?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Alerts still in `open` status, newest first.
    pub async fn open_alerts(&self, limit: usize) -> Result<Vec<AnomalyAlert>, StoreError> {
        let conn = self.db.conn();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT id, sensor_id, kind, severity, confidence, description,
                            evidence, recommended_actions, status, created_at, updated_at
                     FROM anomaly_alerts
                     WHERE status = 'open'
                     ORDER BY created_at DESC
                     LIMIT ?1",
                )
                .map_err(|e| classify(e, ""))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_alert)
                .map_err(|e| classify(e, ""))?;
            let mut alerts = Vec::new();
            for row in rows {
                alerts.push(row.map_err(|e| classify(e, ""))?);
            }
            Ok(alerts)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    /// Transition an alert's triage status.  Returns `false` when the ID is
    /// unknown.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: AlertStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let changed = conn
                .execute(
                    "UPDATE anomaly_alerts SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id.to_string(), status.to_string(), encode_ts(Utc::now())],
                )
                .map_err(|e| classify(e, ""))?;
            Ok(changed > 0)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnomalyAlert> {
    let id_str: String = row.get(0)?;
    let evidence: String = row.get(6)?;
    let actions: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    let created: String = row.get(9)?;
    let updated: Option<String> = row.get(10)?;
    Ok(AnomalyAlert {
        id: Uuid::parse_str(&id_str).map_err(|e| {
            rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
        })?,
        sensor_id: row.get(1)?,
        kind: row.get(2)?,
        severity: row.get::<_, i64>(3)? as u8,
        confidence: row.get(4)?,
        description: row.get(5)?,
        evidence: serde_json::from_str(&evidence).map_err(|e| {
            rusqlite::Error::InvalidColumnType(6, e.to_string(), rusqlite::types::Type::Text)
        })?,
        recommended_actions: serde_json::from_str(&actions).map_err(|e| {
            rusqlite::Error::InvalidColumnType(7, e.to_string(), rusqlite::types::Type::Text)
        })?,
        status: status_str.parse::<AlertStatus>().map_err(|e| {
            rusqlite::Error::InvalidColumnType(8, e, rusqlite::types::Type::Text)
        })?,
        created_at: decode_ts(&created)?,
        updated_at: updated.as_deref().map(decode_ts).transpose()?,
    })
}
