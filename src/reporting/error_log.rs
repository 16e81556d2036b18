//! Bounded error history with persistence and storage recovery.

use super::{log_report, ErrorKind, ErrorReport, ErrorReporter};
use crate::storage::{self, DurableStorage, StorageError, ERRORS_KEY, PRESENCE_KEY};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// In-memory history size.
pub const MAX_RECENT_ERRORS: usize = 50;

/// Persisted history size under `gartenplaner_errors`.
pub const MAX_PERSISTED_ERRORS: usize = 100;

/// Errors kept after a storage recovery pass.
const RECOVERY_KEEP_ERRORS: usize = 10;

/// Presence entries older than this are dropped during recovery.
const RECOVERY_PRESENCE_MAX_AGE_MS: u64 = 60_000;

/// Callback invoked for each report of a subscribed kind.
pub type ErrorListener = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Error reporter that remembers what it saw.
pub struct ErrorLog {
    storage: Option<Arc<dyn DurableStorage>>,
    recent: Mutex<VecDeque<ErrorReport>>,
    listeners: Mutex<HashMap<ErrorKind, Vec<ErrorListener>>>,
    /// Serializes read-modify-write cycles on the persisted keys.
    write_lock: Mutex<()>,
}

impl ErrorLog {
    /// Keep reports in memory only.
    pub fn in_memory() -> Self {
        Self {
            storage: None,
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
            listeners: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Keep reports in memory and persist them to `storage`.
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::in_memory()
        }
    }

    /// Register a listener for one kind of report.
    pub fn on(&self, kind: ErrorKind, listener: ErrorListener) {
        self.listeners.lock().entry(kind).or_default().push(listener);
    }

    /// Most recent reports, oldest first.
    pub fn recent(&self) -> Vec<ErrorReport> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Reports currently persisted (empty without storage).
    pub fn persisted(&self) -> Vec<ErrorReport> {
        let Some(storage) = &self.storage else {
            return Vec::new();
        };
        storage::read_json::<Vec<ErrorReport>>(storage.as_ref(), ERRORS_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Forget the in-memory history and erase the persisted one.
    pub fn clear(&self) {
        self.recent.lock().clear();
        let _guard = self.write_lock.lock();
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove(ERRORS_KEY) {
                tracing::warn!(error = %e, "Failed to clear persisted errors");
            }
        }
    }

    /// Free space: keep only the newest persisted errors and drop presence
    /// entries that have not been refreshed for a minute.
    pub fn recover_storage(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        self.recover_locked()
    }

    fn recover_locked(&self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let errors = self.persisted();
        if errors.len() > RECOVERY_KEEP_ERRORS {
            let tail = &errors[errors.len() - RECOVERY_KEEP_ERRORS..];
            storage::write_json(storage.as_ref(), ERRORS_KEY, tail)?;
        }

        if let Ok(Some(mut presence)) =
            storage::read_json::<HashMap<String, u64>>(storage.as_ref(), PRESENCE_KEY)
        {
            let now = crate::now_ms();
            let before = presence.len();
            presence.retain(|_, last_seen| {
                now.saturating_sub(*last_seen) <= RECOVERY_PRESENCE_MAX_AGE_MS
            });
            if presence.len() != before {
                storage::write_json(storage.as_ref(), PRESENCE_KEY, &presence)?;
            }
        }

        tracing::info!("Storage recovery pass finished");
        Ok(())
    }

    fn persist(&self, report: &ErrorReport) {
        let Some(storage) = &self.storage else {
            return;
        };
        let _guard = self.write_lock.lock();
        let mut errors = self.persisted();
        errors.push(report.clone());
        if errors.len() > MAX_PERSISTED_ERRORS {
            let excess = errors.len() - MAX_PERSISTED_ERRORS;
            errors.drain(..excess);
        }

        match storage::write_json(storage.as_ref(), ERRORS_KEY, &errors) {
            Ok(()) => {}
            Err(e) if e.is_quota() => {
                if let Err(e) = self.recover_locked() {
                    tracing::warn!(error = %e, "Storage recovery failed");
                }
                // One retry with just this report.
                if let Err(e) = storage::write_json(storage.as_ref(), ERRORS_KEY, &[report]) {
                    tracing::warn!(error = %e, "Failed to persist error report");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to persist error report"),
        }
    }
}

impl ErrorReporter for ErrorLog {
    fn report(&self, report: ErrorReport) {
        log_report(&report);

        {
            let mut recent = self.recent.lock();
            if recent.len() >= MAX_RECENT_ERRORS {
                recent.pop_front();
            }
            recent.push_back(report.clone());
        }

        self.persist(&report);

        if matches!(report.kind, ErrorKind::Storage | ErrorKind::Quota) {
            if let Err(e) = self.recover_storage() {
                tracing::warn!(error = %e, "Storage recovery failed");
            }
        }

        let listeners: Vec<ErrorListener> = self
            .listeners
            .lock()
            .get(&report.kind)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(&report);
        }
    }
}
