use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Process-wide keyed store with a per-entry TTL (spec §4.L). Expired
/// entries are evicted both lazily, on the next access, and eagerly, by a
/// background sweeper -- so a key nobody reads before it expires still gets
/// reclaimed instead of leaking until the process's generic cache outgrows
/// memory.
pub struct LocalCache<K, V> {
    entries: DashMap<K, Entry<V>>,
}

impl<K, V> LocalCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Evicts on access: a get past its expiry returns `None` and removes
    /// the stale entry rather than returning stale data and letting the
    /// sweeper catch up later.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let hit = self.entries.get(key)?;
        if hit.expires_at <= now {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.value.clone())
    }

    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        count
    }
}

impl<K, V> Default for LocalCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Background sweeper: evicts expired entries every `sweep_interval`
/// regardless of access, matching the teacher's fixed-`tokio::time::interval`
/// tick-loop idiom used elsewhere for periodic housekeeping.
pub fn spawn_sweeper<K, V>(
    cache: Arc<LocalCache<K, V>>,
    sweep_interval: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = cache.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "local cache sweep evicted expired entries");
                    }
                }
                _ = shutdown.notified() => {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_past_ttl_evicts_and_returns_none() {
        let cache: LocalCache<&str, i32> = LocalCache::new();
        cache.insert("k", 1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn fresh_entry_is_returned() {
        let cache: LocalCache<&str, i32> = LocalCache::new();
        cache.insert("k", 42, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(42));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache: LocalCache<&str, i32> = LocalCache::new();
        cache.insert("stale", 1, Duration::from_millis(0));
        cache.insert("fresh", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        let evicted = cache.sweep();
        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"fresh"), Some(2));
    }
}
