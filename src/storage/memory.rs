//! In-process storage with an optional byte budget.
//!
//! Several peers in one process share a single `Arc<MemoryStorage>`, the
//! same way browser tabs share one origin's `localStorage`.

use super::{ChangeNotifier, DurableStorage, StorageError, StorageEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Thread-safe in-memory key-value store.
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    /// Byte budget over keys and values (`None` = unlimited).
    quota_bytes: Option<usize>,
    notifier: ChangeNotifier,
}

impl MemoryStorage {
    /// Create an unlimited store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: None,
            notifier: ChangeNotifier::new(),
        }
    }

    /// Create a store that rejects writes beyond `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// Bytes currently used by keys and values.
    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.lock();
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        {
            let mut entries = self.entries.lock();
            if let Some(quota) = self.quota_bytes {
                let used: usize = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let needed = key.len() + value.len();
                let available = quota.saturating_sub(used);
                if needed > available {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                        needed,
                        available,
                    });
                }
            }
            entries.insert(key.to_string(), value.to_string());
        }
        self.notifier.notify(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let existed = self.entries.lock().remove(key).is_some();
        if existed {
            self.notifier.notify(key, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let storage = MemoryStorage::new();
        assert!(storage.get("k").unwrap().is_none());

        storage.set("k", "v1").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v1"));

        storage.set("k", "v2").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(storage.len(), 1);

        storage.remove("k").unwrap();
        assert!(storage.get("k").unwrap().is_none());
        assert!(storage.is_empty());

        // Removing again is fine.
        storage.remove("k").unwrap();
    }

    #[test]
    fn quota_rejects_oversized_write() {
        let storage = MemoryStorage::with_quota(16);
        storage.set("ab", "0123456789").unwrap();

        let err = storage.set("cd", "0123456789").unwrap_err();
        assert!(err.is_quota());

        // Original value untouched.
        assert!(storage.get("cd").unwrap().is_none());
        assert_eq!(storage.used_bytes(), 12);
    }

    #[test]
    fn quota_counts_replacement_not_addition() {
        let storage = MemoryStorage::with_quota(12);
        storage.set("ab", "0123456789").unwrap();
        // Replacing the same key frees the old value first.
        storage.set("ab", "9876543210").unwrap();
        assert_eq!(storage.get("ab").unwrap().as_deref(), Some("9876543210"));
    }

    #[test]
    fn subscribers_see_changes() {
        let storage = MemoryStorage::new();
        let mut rx = storage.subscribe();

        storage.set("k", "v").unwrap();
        storage.remove("k").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.key, "k");
        assert_eq!(first.new_value.as_deref(), Some("v"));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.key, "k");
        assert!(second.new_value.is_none());
    }

    #[test]
    fn failed_write_is_not_broadcast() {
        let storage = MemoryStorage::with_quota(4);
        let mut rx = storage.subscribe();
        assert!(storage.set("key", "too long").is_err());
        assert!(rx.try_recv().is_err());
    }
}
