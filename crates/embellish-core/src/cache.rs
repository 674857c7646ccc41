//! Expiring, namespaced payload cache on top of a [`KeyValueStore`].
//!
//! Each logical key is persisted under `prefix + key` as
//! `{"storedAt": <epoch ms>, "data": <payload>}`. An entry is valid while
//! `now - storedAt < ttl`; expired entries are deleted lazily on read.
//!
//! Writes never fail the caller. On quota exhaustion the oldest half of the
//! namespace is evicted and the write is retried once; if the retry fails too
//! the payload is dropped with a log line.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::KeyValueStore;

/// Persisted form of a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Epoch milliseconds when the entry was written.
    pub stored_at: u64,
    /// Payload; `null` records a "no data" answer.
    pub data: Value,
}

impl CacheEntry {
    /// Decode a persisted entry.
    pub fn decode(text: &str) -> Result<Self, StoreError> {
        serde_json::from_str(text).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Age at `now_ms`, saturating for clocks that stepped backwards.
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stored_at)
    }
}

/// What happened to a `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// Stored on the second try after a forced eviction.
    StoredAfterEviction { evicted: usize },
    /// Dropped; the cache stays usable.
    Dropped,
}

/// Listing row for tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    /// Logical key (prefix stripped).
    pub key: String,
    /// `None` when the stored text could not be decoded.
    pub stored_at: Option<u64>,
    pub expired: bool,
    pub bytes: usize,
}

/// Aggregate counts over the namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub corrupt: usize,
    pub bytes: usize,
}

/// TTL cache bound to one key namespace.
pub struct TtlCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TtlCache {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
            ttl,
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn is_expired(&self, entry: &CacheEntry, now_ms: u64) -> bool {
        u128::from(entry.age_ms(now_ms)) >= self.ttl.as_millis()
    }

    fn remove_quietly(&self, storage_key: &str) {
        if let Err(err) = self.store.remove(storage_key) {
            warn!(key = storage_key, error = %err, "Cache delete failed");
        }
    }

    /// Delete `keys` in one store call; returns how many are gone.
    fn remove_all_quietly(&self, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }
        match self.store.remove_many(keys) {
            Ok(()) => keys.len(),
            Err(err) => {
                warn!(count = keys.len(), error = %err, "Cache batch delete failed");
                0
            }
        }
    }

    /// Payload for `key`, or `None` when missing, expired or unreadable.
    pub fn get(&self, key: &str) -> Option<Value> {
        let storage_key = self.storage_key(key);
        let raw = match self.store.get(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "Cache read failed");
                return None;
            }
        };

        let entry = match CacheEntry::decode(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "Discarding undecodable cache entry");
                return None;
            }
        };

        if self.is_expired(&entry, self.clock.now_ms()) {
            debug!(key, stored_at = entry.stored_at, "Cache entry expired");
            self.remove_quietly(&storage_key);
            return None;
        }

        Some(entry.data)
    }

    /// Whether `key` holds a valid entry.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store `data` under `key` stamped with the current time.
    pub fn set(&self, key: &str, data: &Value) -> WriteOutcome {
        let storage_key = self.storage_key(key);
        let entry = CacheEntry {
            stored_at: self.clock.now_ms(),
            data: data.clone(),
        };
        let text = match entry.encode() {
            Ok(text) => text,
            Err(err) => {
                error!(key, error = %err, "Cache entry could not be encoded");
                return WriteOutcome::Dropped;
            }
        };

        match self.store.set(&storage_key, &text) {
            Ok(()) => WriteOutcome::Stored,
            Err(err) if err.is_quota() => {
                warn!(key, error = %err, "Cache write hit quota; evicting oldest entries");
                let evicted = self.cleanup(true);
                match self.store.set(&storage_key, &text) {
                    Ok(()) => WriteOutcome::StoredAfterEviction { evicted },
                    Err(err) => {
                        error!(key, error = %err, "Cache full; dropping write");
                        WriteOutcome::Dropped
                    }
                }
            }
            Err(err) => {
                warn!(key, error = %err, "Cache write failed");
                WriteOutcome::Dropped
            }
        }
    }

    fn namespace_keys(&self) -> Vec<String> {
        match self.store.keys_with_prefix(&self.prefix) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Cache enumeration failed");
                Vec::new()
            }
        }
    }

    fn decode_stored(&self, storage_key: &str) -> Option<CacheEntry> {
        self.store
            .get(storage_key)
            .ok()
            .flatten()
            .and_then(|raw| CacheEntry::decode(&raw).ok())
    }

    /// Remove entries and return how many were deleted.
    ///
    /// Non-forced: expired and undecodable entries only. Forced: the oldest
    /// `ceil(n / 2)` entries by `storedAt`, undecodable ones sorting first.
    pub fn cleanup(&self, force: bool) -> usize {
        let keys = self.namespace_keys();

        if force {
            let mut aged: Vec<(u64, String)> = keys
                .into_iter()
                .map(|k| {
                    let stored_at = self.decode_stored(&k).map_or(0, |e| e.stored_at);
                    (stored_at, k)
                })
                .collect();
            aged.sort();

            let delete_count = aged.len().div_ceil(2);
            let oldest: Vec<String> = aged.into_iter().take(delete_count).map(|(_, k)| k).collect();
            let removed = self.remove_all_quietly(&oldest);
            info!(removed, "Cache force-cleanup");
            return removed;
        }

        let now = self.clock.now_ms();
        let stale: Vec<String> = keys
            .into_iter()
            .filter(|key| {
                self.decode_stored(key)
                    .is_none_or(|entry| self.is_expired(&entry, now))
            })
            .collect();
        let removed = self.remove_all_quietly(&stale);
        if removed > 0 {
            info!(removed, "Cache cleanup removed expired entries");
        }
        removed
    }

    /// Delete every entry in the namespace.
    pub fn clear(&self) -> usize {
        self.remove_all_quietly(&self.namespace_keys())
    }

    /// Snapshot of the namespace, oldest first.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = self.clock.now_ms();
        let mut rows: Vec<EntryInfo> = self
            .namespace_keys()
            .into_iter()
            .map(|storage_key| {
                let raw = self.store.get(&storage_key).ok().flatten().unwrap_or_default();
                let entry = CacheEntry::decode(&raw).ok();
                EntryInfo {
                    key: storage_key[self.prefix.len()..].to_string(),
                    stored_at: entry.as_ref().map(|e| e.stored_at),
                    expired: entry.as_ref().is_none_or(|e| self.is_expired(e, now)),
                    bytes: storage_key.len() + raw.len(),
                }
            })
            .collect();
        rows.sort_by_key(|row| row.stored_at.unwrap_or(0));
        rows
    }

    pub fn stats(&self) -> CacheStats {
        self.entries()
            .iter()
            .fold(CacheStats::default(), |mut stats, row| {
                stats.entries += 1;
                stats.bytes += row.bytes;
                if row.stored_at.is_none() {
                    stats.corrupt += 1;
                } else if row.expired {
                    stats.expired += 1;
                }
                stats
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn cache_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> TtlCache {
        TtlCache::new(store, clock, "t_", HOUR)
    }

    #[test]
    fn ttl_boundary_scenario() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, Arc::clone(&clock));

        cache.set("a", &json!({"v": 1}));

        clock.set(3_599_000);
        assert_eq!(cache.get("a"), Some(json!({"v": 1})));

        clock.set(3_601_000);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn entry_is_absent_exactly_at_ttl() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock));

        cache.set("a", &json!(1));
        clock.set(1_000 + 3_600_000 - 1);
        assert!(cache.contains("a"));
        clock.set(1_000 + 3_600_000);
        assert!(!cache.contains("a"));
        // Lazily removed on the expired read.
        assert!(store.is_empty());
    }

    #[test]
    fn persisted_layout_is_prefixed_json() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(42));
        let cache = cache_with(Arc::clone(&store), clock);

        cache.set("movie_7", &json!({"score": 8}));
        let raw = store.get("t_movie_7").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({"storedAt": 42, "data": {"score": 8}}));
    }

    #[test]
    fn no_data_is_cached_as_null() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, clock);

        cache.set("nothing", &Value::Null);
        assert_eq!(cache.get("nothing"), Some(Value::Null));
    }

    #[test]
    fn corrupt_entries_read_as_absent() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), clock);

        store.set("t_bad", "{\"data\": 1}").unwrap();
        assert_eq!(cache.get("bad"), None);
        assert_eq!(cache.stats().corrupt, 1);
    }

    #[test]
    fn forced_cleanup_keeps_most_recent_half() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock));

        for i in 0..10 {
            clock.set(i * 1_000);
            cache.set(&format!("k{i}"), &json!(i));
        }
        assert_eq!(cache.cleanup(true), 5);

        let remaining: Vec<String> = cache.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(remaining, vec!["k5", "k6", "k7", "k8", "k9"]);
    }

    #[test]
    fn forced_cleanup_rounds_up_and_evicts_corrupt_first() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(5_000));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock));

        cache.set("fresh", &json!(1));
        clock.advance(Duration::from_secs(1));
        cache.set("fresher", &json!(2));
        store.set("t_garbage", "not json").unwrap();

        assert_eq!(cache.cleanup(true), 2);
        assert_eq!(store.keys_with_prefix("t_").unwrap(), vec!["t_fresher"]);
    }

    #[test]
    fn plain_cleanup_removes_only_expired_and_corrupt() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock));

        cache.set("old", &json!(1));
        clock.set(3_000_000);
        cache.set("new", &json!(2));
        store.set("t_bad", "[]").unwrap();
        store.set("other_namespace", "[]").unwrap();
        clock.set(3_700_000);

        assert_eq!(cache.cleanup(false), 2);
        assert_eq!(
            store.keys_with_prefix("").unwrap(),
            vec!["other_namespace", "t_new"]
        );
    }

    #[test]
    fn quota_failure_evicts_then_retries() {
        // Each entry is 33 bytes; room for three.
        let store = Arc::new(MemoryStore::with_quota(130));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = cache_with(Arc::clone(&store), Arc::clone(&clock));

        let mut outcomes = Vec::new();
        for i in 0..4 {
            clock.advance(Duration::from_millis(1));
            outcomes.push(cache.set(&format!("k{i}"), &json!(i)));
        }

        assert_eq!(&outcomes[..3], &[WriteOutcome::Stored; 3]);
        assert_eq!(outcomes[3], WriteOutcome::StoredAfterEviction { evicted: 2 });
        assert!(!cache.contains("k0"));
        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2"));
        assert!(cache.contains("k3"));
    }

    #[test]
    fn oversized_write_is_dropped_silently() {
        let store = Arc::new(MemoryStore::with_quota(16));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(store, clock);

        let outcome = cache.set("big", &json!("x".repeat(64)));
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert!(!cache.contains("big"));
    }

    #[test]
    fn clear_only_touches_namespace() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(Arc::clone(&store), clock);

        cache.set("a", &json!(1));
        cache.set("b", &json!(2));
        store.set("keep", "1").unwrap();
        assert_eq!(cache.clear(), 2);
        assert_eq!(store.keys_with_prefix("").unwrap(), vec!["keep"]);
    }
}
