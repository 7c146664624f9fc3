// ── Query cache ──
//
// Read-through cache keyed by query identity. Entries carry the entity
// ids they were derived from so a write to any of those entities can
// invalidate them. Callers only commit positive results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::schedule::next_aligned;

/// Default age past which [`QueryCache::purge_expired`] drops entries.
pub const EXPIRY_HORIZON: Duration = Duration::from_secs(3600);

/// Period of the background expiry sweep.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry<V> {
    value: V,
    stored: Instant,
    ids: Vec<String>,
}

pub struct QueryCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    by_id: DashMap<String, HashSet<String>>,
    horizon: Duration,
}

impl<V> Default for QueryCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            by_id: DashMap::new(),
            horizon: EXPIRY_HORIZON,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache whose sweep keeps entries for `horizon`, for callers that
    /// fetch with longer ages than [`EXPIRY_HORIZON`].
    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            horizon,
            ..Self::default()
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Store `value` under `key`, associated with `ids`.
    pub fn commit<I, S>(&self, key: impl Into<String>, value: V, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        for id in &ids {
            self.by_id
                .entry(id.clone())
                .or_default()
                .insert(key.clone());
        }
        trace!(key = %key, "cache commit");
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored: Instant::now(),
                ids,
            },
        );
    }

    /// Cached value if younger than `max_age`. Older entries are evicted.
    pub fn fetch(&self, key: &str, max_age: Duration) -> Option<V> {
        {
            let entry = self.entries.get(key)?;
            if entry.stored.elapsed() < max_age {
                return Some(entry.value.clone());
            }
        }
        self.purge(key);
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn purge(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            for id in entry.ids {
                if let Some(mut keys) = self.by_id.get_mut(&id) {
                    keys.remove(key);
                }
                self.by_id.remove_if(&id, |_, keys| keys.is_empty());
            }
        }
    }

    /// Drop every entry associated with entity `id`.
    pub fn purge_by_id(&self, id: &str) {
        let Some((_, keys)) = self.by_id.remove(id) else {
            return;
        };
        debug!(id, count = keys.len(), "purging cache entries for entity");
        for key in keys {
            self.purge(&key);
        }
    }

    /// Drop entries older than the horizon. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.stored.elapsed() >= self.horizon)
            .map(|e| e.key().clone())
            .collect();
        for key in &stale {
            self.purge(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expire old entries on minute boundaries until cancelled.
pub async fn purge_task<V: Clone + Send + Sync + 'static>(
    cache: Arc<QueryCache<V>>,
    cancel: CancellationToken,
) {
    loop {
        let delay = next_aligned(Utc::now(), PURGE_INTERVAL);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired cache entries");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fetch_respects_max_age_and_evicts() {
        let cache: QueryCache<bool> = QueryCache::new();
        cache.commit("receiver:A on B", true, ["sensor-1"]);

        assert_eq!(cache.fetch("receiver:A on B", Duration::from_secs(60)), Some(true));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.fetch("receiver:A on B", Duration::from_secs(60)), None);
        assert!(!cache.contains("receiver:A on B"));
    }

    #[tokio::test]
    async fn purge_by_id_drops_associated_entries() {
        let cache: QueryCache<u32> = QueryCache::new();
        cache.commit("q1", 1, ["platform-1", "sensor-1"]);
        cache.commit("q2", 2, ["sensor-1"]);
        cache.commit("q3", 3, ["sensor-2"]);

        cache.purge_by_id("sensor-1");
        assert!(!cache.contains("q1"));
        assert!(!cache.contains("q2"));
        assert!(cache.contains("q3"));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sweep_removes_old_entries() {
        let cache: QueryCache<u32> = QueryCache::new();
        cache.commit("old", 1, Vec::<String>::new());
        tokio::time::advance(Duration::from_secs(1800)).await;
        cache.commit("fresh", 2, Vec::<String>::new());
        tokio::time::advance(Duration::from_secs(1800)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn longer_horizons_outlive_the_default_sweep() {
        let cache: QueryCache<bool> = QueryCache::with_horizon(Duration::from_secs(7200));
        cache.commit("stale:A on B", true, Vec::<String>::new());
        tokio::time::advance(EXPIRY_HORIZON + Duration::from_secs(60)).await;

        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.fetch("stale:A on B", Duration::from_secs(7200)), Some(true));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.purge_expired(), 1);
    }
}
