//! Key-value persistence with a byte quota.
//!
//! [`KeyValueStore`] models browser-style local storage: string keys, string
//! values, prefix enumeration, and a write that fails with
//! [`StoreError::QuotaExceeded`] once the quota is spent. Usage is measured
//! as `key.len() + value.len()` summed over every stored pair.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::StoreError;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key in `keys`. Stores that persist override this to do
    /// a single write.
    fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        keys.iter().try_for_each(|key| self.remove(key))
    }

    /// Every stored key starting with `prefix`, in lexical order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

fn usage(entries: &BTreeMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// Check that replacing `key` with `value` stays within `quota`.
fn check_quota(
    entries: &BTreeMap<String, String>,
    quota: Option<usize>,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let existing = entries.get(key).map_or(0, |v| key.len() + v.len());
    let used = usage(entries) - existing;
    let needed = key.len() + value.len();
    if used + needed > quota {
        return Err(StoreError::QuotaExceeded {
            key: key.to_string(),
            needed,
            available: quota.saturating_sub(used),
        });
    }
    Ok(())
}

/// In-process store, optionally bounded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        usage(&self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        check_quota(&entries, self.quota_bytes, key, value)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// A store persisted as a single JSON object on disk.
///
/// The whole map is rewritten on every mutation through a temp file and a
/// rename, so a crash never leaves a half-written store behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        debug!(path = %path.display(), entries = entries.len(), "Opened file store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            quota_bytes: None,
        })
    }

    #[must_use]
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Default store location (`<data dir>/embellish/cache.json`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("embellish")
            .join("cache.json")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        usage(&self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(entries)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        check_quota(&entries, self.quota_bytes, key, value)?;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(err) = self.persist(&entries) {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.remove_many(&[key.to_string()])
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed: Vec<(String, String)> = keys
            .iter()
            .filter_map(|key| entries.remove_entry(key))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.persist(&entries) {
            entries.extend(removed);
            return Err(err);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_basic_ops() {
        let store = MemoryStore::new();
        store.set("a_1", "x").unwrap();
        store.set("a_2", "y").unwrap();
        store.set("b_1", "z").unwrap();
        assert_eq!(store.get("a_1").unwrap().as_deref(), Some("x"));
        assert_eq!(store.keys_with_prefix("a_").unwrap(), vec!["a_1", "a_2"]);
        store.remove("a_1").unwrap();
        assert_eq!(store.get("a_1").unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn memory_store_enforces_quota() {
        let store = MemoryStore::with_quota(10);
        store.set("k1", "1234").unwrap(); // 6 bytes
        let err = store.set("k2", "12345").unwrap_err(); // 7 more
        assert!(err.is_quota());
        if let StoreError::QuotaExceeded {
            needed, available, ..
        } = err
        {
            assert_eq!(needed, 7);
            assert_eq!(available, 4);
        }
        assert_eq!(store.get("k2").unwrap(), None);
    }

    #[test]
    fn overwrite_counts_only_the_delta() {
        let store = MemoryStore::with_quota(10);
        store.set("k1", "12345678").unwrap(); // 10 bytes, full
        store.set("k1", "abcdefgh").unwrap(); // replaces in place
        assert_eq!(store.used_bytes(), 10);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set("p_a", "1").unwrap();
            store.set("p_b", "2").unwrap();
            store.remove("p_a").unwrap();
        }
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("p_a").unwrap(), None);
        assert_eq!(reopened.get("p_b").unwrap().as_deref(), Some("2"));
        assert_eq!(reopened.keys_with_prefix("p_").unwrap(), vec!["p_b"]);
    }

    #[test]
    fn file_store_removes_in_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = FileStore::open(&path).unwrap();
        for key in ["p_a", "p_b", "p_c"] {
            store.set(key, "v").unwrap();
        }
        store
            .remove_many(&["p_a".to_string(), "p_c".to_string(), "p_missing".to_string()])
            .unwrap();
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.keys_with_prefix("p_").unwrap(), vec!["p_b"]);
    }

    #[test]
    fn file_store_remove_rolls_back_when_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = FileStore::open(&path).unwrap();
        store.set("p_a", "1").unwrap();
        store.set("p_b", "2").unwrap();

        // A directory where the temp file goes makes the rewrite fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        assert!(matches!(store.remove("p_a"), Err(StoreError::Io(_))));
        assert!(store.remove_many(&["p_a".to_string(), "p_b".to_string()]).is_err());

        assert_eq!(store.get("p_a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys_with_prefix("p_").unwrap(), vec!["p_a", "p_b"]);
        let on_disk = FileStore::open(&path).unwrap();
        assert_eq!(on_disk.keys_with_prefix("p_").unwrap(), vec!["p_a", "p_b"]);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn file_store_quota_rejects_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = FileStore::open(&path).unwrap().with_quota(4);
        assert!(store.set("key", "value").unwrap_err().is_quota());
        assert!(!path.exists());
    }
}
