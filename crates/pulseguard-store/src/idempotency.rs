//! Keyed TTL set with atomic set-if-absent.
//!
//! Given an idempotency key and a candidate event ID, [`IdempotencyStore::reserve`]
//! decides atomically whether this is a first-time submission or a replay
//! inside the TTL window.  Two simultaneous submissions of the same key yield
//! exactly one [`Reservation::FirstTime`]; everyone else observes
//! [`Reservation::Duplicate`] with the original event ID.
//!
//! Two reference implementations:
//!
//! - [`MemoryIdempotencyStore`] – single-replica, a 16-way shard-striped
//!   mutex map to keep contention flat under high-QPS ingestion.
//! - [`SqliteIdempotencyStore`] – a shared keyed store (set-if-absent with
//!   expiry) for multi-replica deployments pointing at one database file.
//!
//! Expired keys behave as absent.  A periodic [`sweep`](MemoryIdempotencyStore::sweep)
//! reclaims space; correctness never depends on it.  Backend failures surface
//! as [`StoreError::Unavailable`] — the system never silently treats an
//! unknown key as a duplicate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::params;
use uuid::Uuid;

use crate::{Database, StoreError};

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key was unseen (or expired); the candidate event ID now owns it.
    FirstTime,
    /// The key is live; the original event ID is returned so the caller can
    /// replay the original response.
    Duplicate(Uuid),
}

/// Pluggable reservation backend.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim `key` for `event_id`, or learn who claimed it first.
    async fn reserve(
        &self,
        key: &str,
        event_id: Uuid,
        ttl: Duration,
    ) -> Result<Reservation, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

const SHARD_COUNT: usize = 16;

struct Shard {
    entries: Mutex<HashMap<String, (Uuid, Instant)>>,
}

/// Single-replica reservation map, shard-striped to limit lock contention.
pub struct MemoryIdempotencyStore {
    shards: Vec<Shard>,
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Shard {
                    entries: Mutex::new(HashMap::new()),
                })
                .collect(),
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Drop expired entries across all shards.  Returns how many were
    /// reclaimed.  Reservation correctness does not depend on this running.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.entries.lock().unwrap_or_else(|e| e.into_inner());
            let before = entries.len();
            entries.retain(|_, (_, expires)| *expires > now);
            removed += before - entries.len();
        }
        removed
    }

    /// Live (non-expired) entry count, for metrics.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|s| {
                s.entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .values()
                    .filter(|(_, expires)| *expires > now)
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn reserve(
        &self,
        key: &str,
        event_id: Uuid,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let now = Instant::now();
        let shard = self.shard_for(key);
        let mut entries = shard.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((original, expires)) if *expires > now => Ok(Reservation::Duplicate(*original)),
            _ => {
                entries.insert(key.to_string(), (event_id, now + ttl));
                Ok(Reservation::FirstTime)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Shared keyed store over the `idempotency_keys` table.
///
/// The reserve is a single `INSERT ... ON CONFLICT DO NOTHING` followed by a
/// read-back inside one immediate transaction, so replicas sharing the file
/// agree on exactly one winner per key.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    db: Database,
}

impl SqliteIdempotencyStore {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    /// Remove expired rows.  Returns the number reclaimed.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
                params![chrono::Utc::now().timestamp()],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn reserve(
        &self,
        key: &str,
        event_id: Uuid,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let conn = self.db.conn();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let now = chrono::Utc::now().timestamp();
            let expires_at = now + ttl.as_secs() as i64;
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            // Expired rows behave as absent.
            tx.execute(
                "DELETE FROM idempotency_keys WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            tx.execute(
                "INSERT INTO idempotency_keys (key, event_id, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, event_id.to_string(), expires_at],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let owner: String = tx
                .query_row(
                    "SELECT event_id FROM idempotency_keys WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            tx.commit()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;

            let owner = Uuid::parse_str(&owner)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            if owner == event_id {
                Ok(Reservation::FirstTime)
            } else {
                Ok(Reservation::Duplicate(owner))
            }
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn first_reserve_wins_second_sees_original() {
        let store = MemoryIdempotencyStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            store.reserve("k1", first, TTL).await.unwrap(),
            Reservation::FirstTime
        );
        assert_eq!(
            store.reserve("k1", second, TTL).await.unwrap(),
            Reservation::Duplicate(first)
        );
    }

    #[tokio::test]
    async fn expired_key_behaves_as_absent() {
        let store = MemoryIdempotencyStore::new();
        let first = Uuid::new_v4();
        store
            .reserve("k1", first, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = Uuid::new_v4();
        assert_eq!(
            store.reserve("k1", second, TTL).await.unwrap(),
            Reservation::FirstTime
        );
    }

    #[tokio::test]
    async fn concurrent_reserves_yield_exactly_one_first_time() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.reserve("hot-key", Uuid::new_v4(), TTL).await.unwrap()
            }));
        }
        let mut first_times = 0;
        let mut originals = std::collections::HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                Reservation::FirstTime => first_times += 1,
                Reservation::Duplicate(original) => {
                    originals.insert(original);
                }
            }
        }
        assert_eq!(first_times, 1);
        // Every duplicate saw the same original.
        assert!(originals.len() <= 1);
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_entries() {
        let store = MemoryIdempotencyStore::new();
        store
            .reserve("gone", Uuid::new_v4(), Duration::from_millis(5))
            .await
            .unwrap();
        store.reserve("kept", Uuid::new_v4(), TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_interfere() {
        let store = MemoryIdempotencyStore::new();
        for i in 0..100 {
            let res = store
                .reserve(&format!("key-{i}"), Uuid::new_v4(), TTL)
                .await
                .unwrap();
            assert_eq!(res, Reservation::FirstTime);
        }
        assert_eq!(store.len(), 100);
    }

    #[tokio::test]
    async fn sqlite_store_matches_memory_contract() {
        let db = Database::open_in_memory().unwrap();
        let store = db.idempotency();
        let first = Uuid::new_v4();

        assert_eq!(
            store.reserve("k1", first, TTL).await.unwrap(),
            Reservation::FirstTime
        );
        assert_eq!(
            store.reserve("k1", Uuid::new_v4(), TTL).await.unwrap(),
            Reservation::Duplicate(first)
        );
    }

    #[tokio::test]
    async fn sqlite_expired_key_behaves_as_absent() {
        let db = Database::open_in_memory().unwrap();
        let store = db.idempotency();
        let first = Uuid::new_v4();
        // Zero TTL expires immediately (expires_at == now).
        store
            .reserve("k1", first, Duration::from_secs(0))
            .await
            .unwrap();

        let second = Uuid::new_v4();
        assert_eq!(
            store.reserve("k1", second, TTL).await.unwrap(),
            Reservation::FirstTime
        );
    }

    #[tokio::test]
    async fn sqlite_sweep_reclaims_expired_rows() {
        let db = Database::open_in_memory().unwrap();
        let store = db.idempotency();
        store
            .reserve("gone", Uuid::new_v4(), Duration::from_secs(0))
            .await
            .unwrap();
        store.reserve("kept", Uuid::new_v4(), TTL).await.unwrap();

        assert_eq!(store.sweep().await.unwrap(), 1);
    }
}
