//! SQLite-backed key-value storage for the CLI host.
//!
//! Change notifications only reach subscribers inside the current process;
//! separate processes sharing the same file see each other's writes on
//! their next read.

use super::{ChangeNotifier, DurableStorage, StorageError, StorageEvent};
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use std::path::Path;
use tokio::sync::broadcast;

/// Thread-safe key-value store backed by a single SQLite table.
pub struct SqliteStorage {
    conn: Mutex<rusqlite::Connection>,
    quota_bytes: Option<usize>,
    notifier: ChangeNotifier,
}

impl SqliteStorage {
    /// Open (or create) a file-backed store.
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init_tables(&conn)?;
        tracing::debug!(path = %db_path.display(), "Opened sqlite storage");
        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
            notifier: ChangeNotifier::new(),
        })
    }

    /// Cap the total size of keys and values, like the browser's budget.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Open a private in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
            notifier: ChangeNotifier::new(),
        })
    }

    fn init_tables(conn: &rusqlite::Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl DurableStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        {
            let conn = self.conn.lock();
            if let Some(quota) = self.quota_bytes {
                let used: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                     FROM kv_store WHERE key != ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )?;
                let used = usize::try_from(used).unwrap_or(usize::MAX);
                let needed = key.len() + value.len();
                if used.saturating_add(needed) > quota {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                        needed,
                        available: quota.saturating_sub(used),
                    });
                }
            }
            conn.execute(
                "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )?;
        }
        self.notifier.notify(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM kv_store WHERE key = ?1", rusqlite::params![key])?
        };
        if removed > 0 {
            self.notifier.notify(key, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key ASC")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn in_memory_set_get_remove() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.set("gartenplaner_tasks", "[]").unwrap();
        assert_eq!(
            storage.get("gartenplaner_tasks").unwrap().as_deref(),
            Some("[]")
        );

        storage.set("gartenplaner_tasks", "[1]").unwrap();
        assert_eq!(
            storage.get("gartenplaner_tasks").unwrap().as_deref(),
            Some("[1]")
        );

        storage.remove("gartenplaner_tasks").unwrap();
        assert!(storage.get("gartenplaner_tasks").unwrap().is_none());
    }

    #[test]
    fn keys_are_listed_sorted() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.set("b", "2").unwrap();
        storage.set("a", "1").unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("store.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.set("_gartenplaner_enc_key", "{\"k\":\"abc\"}").unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            reopened.get("_gartenplaner_enc_key").unwrap().as_deref(),
            Some("{\"k\":\"abc\"}")
        );
    }

    #[test]
    fn quota_rejects_oversized_writes() {
        let storage = SqliteStorage::open_in_memory().unwrap().with_quota(32);
        storage.set("gartenplaner_a", "0123456789").unwrap();
        let err = storage.set("gartenplaner_b", "0123456789").unwrap_err();
        assert!(err.is_quota());
        // Replacing an existing value only counts the new size.
        storage.set("gartenplaner_a", "01234567890123").unwrap();
        assert!(storage.get("gartenplaner_b").unwrap().is_none());
    }

    #[test]
    fn notifies_only_on_actual_removal() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut rx = storage.subscribe();
        storage.remove("missing").unwrap();
        assert!(rx.try_recv().is_err());

        storage.set("k", "v").unwrap();
        storage.remove("k").unwrap();
        assert_eq!(rx.try_recv().unwrap().new_value.as_deref(), Some("v"));
        assert!(rx.try_recv().unwrap().new_value.is_none());
    }
}
