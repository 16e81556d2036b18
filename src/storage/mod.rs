//! Durable key-value storage shared between peers.
//!
//! Mirrors the browser's `localStorage` contract: string keys, string
//! values, no transactions across keys. Every write is expected to be a
//! single self-contained value because concurrent writers are not
//! coordinated. Change notifications play the role of the `storage` event
//! and drive the fallback sync transport.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

/// Prefix for application data (swept by [`clear_app_data`]).
pub const APP_PREFIX: &str = "gartenplaner_";

/// Prefix for internal data (keys, salts, logs). Never swept.
pub const INTERNAL_PREFIX: &str = "_gartenplaner_";

/// Active task list.
pub const TASKS_KEY: &str = "gartenplaner_tasks";

/// Archived task list.
pub const ARCHIVED_TASKS_KEY: &str = "gartenplaner_archived_tasks";

/// Presence roster mirror: `peerId -> lastSeenAtMs`.
pub const PRESENCE_KEY: &str = "gartenplaner_presence";

/// Last broadcast message (storage-event fallback transport).
pub const SYNC_KEY: &str = "gartenplaner_sync";

/// Capped error report log.
pub const ERRORS_KEY: &str = "gartenplaner_errors";

/// Exported encryption key (JWK).
pub const ENCRYPTION_KEY_KEY: &str = "_gartenplaner_enc_key";

/// PBKDF2 salt for passphrase-wrapped key exports.
pub const SALT_KEY: &str = "_gartenplaner_salt";

/// Capped persisted log entries.
pub const LOGS_KEY: &str = "_gartenplaner_logs";

/// Browser `localStorage` budget (5 MB).
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The write would exceed the backend's byte budget.
    #[error("storage quota exceeded writing '{key}' ({needed} bytes needed, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },
    /// SQLite failure.
    #[error("sqlite storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Value could not be encoded or decoded as JSON.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether this error is the backend running out of space.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// A change to a single storage key. `new_value` is `None` on removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

/// Key-value storage shared by every peer of one origin.
pub trait DurableStorage: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List every stored key.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Subscribe to change notifications for all keys.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Fan-out of storage change events to subscribers.
#[derive(Debug)]
pub(crate) struct ChangeNotifier {
    tx: broadcast::Sender<StorageEvent>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn notify(&self, key: &str, new_value: Option<&str>) {
        // No subscribers is fine.
        let _ = self.tx.send(StorageEvent {
            key: key.to_string(),
            new_value: new_value.map(str::to_string),
        });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }
}

/// Read and decode a JSON value.
pub fn read_json<T: DeserializeOwned>(
    storage: &dyn DurableStorage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub fn write_json<T: Serialize + ?Sized>(
    storage: &dyn DurableStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    storage.set(key, &raw)
}

/// Remove every application key (`gartenplaner_*`), leaving internal
/// `_gartenplaner_*` keys such as the encryption key untouched.
/// Returns the number of removed keys.
pub fn clear_app_data(storage: &dyn DurableStorage) -> Result<usize, StorageError> {
    let mut removed = 0;
    for key in storage.keys()? {
        if is_app_key(&key) {
            storage.remove(&key)?;
            removed += 1;
        }
    }
    tracing::info!(removed, "Cleared application data");
    Ok(removed)
}

/// Whether `key` is an application key (and not internal).
pub fn is_app_key(key: &str) -> bool {
    key.starts_with(APP_PREFIX) && !key.starts_with(INTERNAL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_key_classification() {
        assert!(is_app_key(TASKS_KEY));
        assert!(is_app_key(SYNC_KEY));
        assert!(!is_app_key(ENCRYPTION_KEY_KEY));
        assert!(!is_app_key(SALT_KEY));
        assert!(!is_app_key("other_tasks"));
    }

    #[test]
    fn clear_app_data_keeps_internal_keys() {
        let storage = MemoryStorage::new();
        storage.set(TASKS_KEY, "[]").unwrap();
        storage.set(PRESENCE_KEY, "{}").unwrap();
        storage.set(ENCRYPTION_KEY_KEY, "{\"k\":\"x\"}").unwrap();
        storage.set("unrelated", "1").unwrap();

        let removed = clear_app_data(&storage).unwrap();
        assert_eq!(removed, 2);
        assert!(storage.get(TASKS_KEY).unwrap().is_none());
        assert!(storage.get(ENCRYPTION_KEY_KEY).unwrap().is_some());
        assert!(storage.get("unrelated").unwrap().is_some());
    }

    #[test]
    fn json_helpers_roundtrip() {
        let storage = MemoryStorage::new();
        write_json(&storage, "gartenplaner_x", &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = read_json(&storage, "gartenplaner_x").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let missing: Option<Vec<u32>> = read_json(&storage, "gartenplaner_none").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn read_json_rejects_garbage() {
        let storage = MemoryStorage::new();
        storage.set("gartenplaner_bad", "{not json").unwrap();
        let result: Result<Option<Vec<u32>>, _> = read_json(&storage, "gartenplaner_bad");
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
