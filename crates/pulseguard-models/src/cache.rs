//! Warm in-process cache of loaded model artifacts.
//!
//! Keyed by `(model_name, version)`, bounded, last-used eviction.  The
//! anomaly-detection agent holds one of these and performs the miss path
//! (artifact load) *outside* the lock, then inserts with double-check
//! semantics via [`ModelCache::insert`]: the first loader wins and every
//! racer adopts its entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::registry::ArtifactScorer;

struct CacheEntry {
    scorer: Arc<dyn ArtifactScorer>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<(String, u32), CacheEntry>,
    tick: u64,
}

/// Bounded `(model_name, version)` → scorer cache.
pub struct ModelCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl ModelCache {
    /// `capacity` below 1 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Look up a scorer, refreshing its last-used tick on hit.
    pub fn get(&self, model_name: &str, version: u32) -> Option<Arc<dyn ArtifactScorer>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let tick = inner.tick;
        inner
            .entries
            .get_mut(&(model_name.to_string(), version))
            .map(|entry| {
                entry.last_used = tick;
                Arc::clone(&entry.scorer)
            })
    }

    /// Insert `scorer`, unless a racer already inserted one for the same key
    /// — in that case the existing entry is returned and the argument is
    /// dropped.  Evicts the least-recently-used entry when full.
    pub fn insert(
        &self,
        model_name: &str,
        version: u32,
        scorer: Arc<dyn ArtifactScorer>,
    ) -> Arc<dyn ArtifactScorer> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let tick = inner.tick;
        let key = (model_name.to_string(), version);

        if let Some(existing) = inner.entries.get_mut(&key) {
            existing.last_used = tick;
            return Arc::clone(&existing.scorer);
        }

        if inner.entries.len() >= self.capacity {
            if let Some(evict_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&evict_key);
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                scorer: Arc::clone(&scorer),
                last_used: tick,
            },
        );
        scorer
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
