//! Tracing layer that persists events into durable storage.
//!
//! Entries land under `_gartenplaner_logs` as a capped JSON array so the
//! browser host and the CLI read the same history.

use std::cell::Cell;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::storage::{self, DurableStorage, StorageError, LOGS_KEY};

thread_local! {
    /// Set while the layer writes, so storage backends that log do not recurse.
    static IN_LAYER: Cell<bool> = const { Cell::new(false) };
}

/// One persisted log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Upper-case level name (`"ERROR"`, `"WARN"`, ...).
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    pub fn is_error(&self) -> bool {
        self.level.eq_ignore_ascii_case("error")
    }
}

// ── Store ───────────────────────────────────────────────────────

/// Capped log history in durable storage.
pub struct LogStore {
    storage: Arc<dyn DurableStorage>,
    max_entries: usize,
    retention: chrono::Duration,
    /// Serializes read-modify-write cycles on the log key.
    write_lock: Mutex<()>,
}

impl LogStore {
    pub fn new(storage: Arc<dyn DurableStorage>, max_entries: usize, retention_hours: u64) -> Self {
        // Capped at ten years so the chrono duration cannot overflow.
        let hours = i64::try_from(retention_hours.min(24 * 365 * 10)).unwrap_or(24);
        Self {
            storage,
            max_entries: max_entries.max(1),
            retention: chrono::Duration::hours(hours),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one entry, dropping the oldest beyond the cap.
    pub fn append(&self, entry: LogEntry) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let mut entries = self.entries();
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        storage::write_json(self.storage.as_ref(), LOGS_KEY, &entries)
    }

    /// All persisted entries, oldest first. Unreadable history reads as empty.
    pub fn entries(&self) -> Vec<LogEntry> {
        storage::read_json::<Vec<LogEntry>>(self.storage.as_ref(), LOGS_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Drop entries older than the retention window unless they are errors.
    /// Returns the number of removed entries.
    pub fn cleanup(&self) -> Result<usize, StorageError> {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock();
        let mut entries = self.entries();
        let before = entries.len();
        let cutoff = now - self.retention;
        entries.retain(|e| e.timestamp > cutoff || e.is_error());
        let removed = before - entries.len();
        if removed > 0 {
            storage::write_json(self.storage.as_ref(), LOGS_KEY, &entries)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        self.storage.remove(LOGS_KEY)
    }
}

/// Run [`LogStore::cleanup`] every `interval` until the handle is aborted.
pub fn spawn_cleanup(store: Arc<LogStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.cleanup() {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Log cleanup"),
                Err(e) => tracing::warn!(error = %e, "Log cleanup failed"),
            }
        }
    })
}

// ── Layer ───────────────────────────────────────────────────────

/// A tracing layer that appends events at or above `min_level` to a [`LogStore`].
pub struct StorageLogLayer {
    store: Arc<LogStore>,
    min_level: Level,
}

impl StorageLogLayer {
    pub fn new(store: Arc<LogStore>, min_level: Level) -> Self {
        Self { store, min_level }
    }
}

impl<S> Layer<S> for StorageLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Lower levels compare greater (ERROR < WARN < INFO).
        if *metadata.level() > self.min_level {
            return;
        }
        if IN_LAYER.with(|flag| flag.replace(true)) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: metadata.level().as_str().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        };
        // Logging must never fail the caller.
        let _ = self.store.append(entry);

        IN_LAYER.with(|flag| flag.set(false));
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{value:?}");
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tracing_subscriber::prelude::*;

    fn store(max_entries: usize) -> Arc<LogStore> {
        Arc::new(LogStore::new(Arc::new(MemoryStorage::new()), max_entries, 24))
    }

    fn entry(level: &str, age_hours: i64) -> LogEntry {
        LogEntry {
            timestamp: Utc::now() - chrono::Duration::hours(age_hours),
            level: level.into(),
            target: "test".into(),
            message: format!("{level} {age_hours}h"),
            fields: serde_json::Map::new(),
        }
    }

    #[test]
    fn layer_persists_events_at_or_above_threshold() {
        let store = store(10);
        let subscriber =
            tracing_subscriber::registry().with(StorageLogLayer::new(store.clone(), Level::WARN));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("ignored");
            tracing::warn!(peer_id = "peer_1", count = 3, "Peer timed out");
            tracing::error!("Seal failed");
        });

        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, "WARN");
        assert_eq!(entries[0].message, "Peer timed out");
        assert_eq!(entries[0].fields["peer_id"], "peer_1");
        assert_eq!(entries[0].fields["count"], 3);
        assert!(entries[1].is_error());
    }

    #[test]
    fn append_keeps_newest_entries() {
        let store = store(3);
        for i in 0..5 {
            let mut e = entry("INFO", 0);
            e.message = format!("m{i}");
            store.append(e).unwrap();
        }
        let messages: Vec<_> = store.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn cleanup_keeps_recent_and_errors() {
        let store = store(10);
        store.append(entry("INFO", 30)).unwrap();
        store.append(entry("ERROR", 30)).unwrap();
        store.append(entry("WARN", 1)).unwrap();

        let removed = store.cleanup().unwrap();
        assert_eq!(removed, 1);
        let levels: Vec<_> = store.entries().into_iter().map(|e| e.level).collect();
        assert_eq!(levels, vec!["ERROR", "WARN"]);
    }

    #[test]
    fn clear_removes_history() {
        let store = store(10);
        store.append(entry("INFO", 0)).unwrap();
        store.clear().unwrap();
        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn spawned_cleanup_runs_periodically() {
        let store = store(10);
        store.append(entry("INFO", 48)).unwrap();
        let handle = spawn_cleanup(store.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();
        assert!(store.entries().is_empty());
    }
}
