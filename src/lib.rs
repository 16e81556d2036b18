//! Gartenplaner core library
//!
//! Local-first garden task planning for several peers sharing one storage
//! origin, with no central server.
//!
//! ## Components
//!
//! - **PresenceSync** ([`sync`]): peer roster with heartbeat timeout and
//!   broadcast of task events
//! - **AdmissionController** ([`security::rate_limiter`]): sliding-window
//!   quotas with rollback of failed operations
//! - **EncryptionAtRest** ([`security::encryption`]): AES-256-GCM sealing
//!   of stored values with key rotation and passphrase backups
//!
//! [`planner::Planner`] composes the three over a [`storage::DurableStorage`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use gartenplaner::{Config, MemoryStorage, Planner, TaskDraft};
//! use std::sync::Arc;
//!
//! let planner = Planner::open(&Config::default(), Arc::new(MemoryStorage::new()), None)?;
//! let task = planner.create_task(&TaskDraft {
//!     title: "Rasen mähen".into(),
//!     employee: "Jonas".into(),
//!     location: "Wiese".into(),
//!     ..TaskDraft::default()
//! })?;
//! planner.complete_task(task.id)?;
//! ```

pub mod config;
pub mod logging;
pub mod planner;
pub mod reporting;
pub mod security;
pub mod storage;
pub mod sync;
pub mod tasks;

pub use config::Config;
pub use planner::Planner;
pub use reporting::{ErrorKind, ErrorLog, ErrorReport, ErrorReporter, TracingReporter};
pub use security::{AdmissionController, EncryptionAtRest, RateLimitExceeded, SealedValue, ValidationError};
pub use storage::{DurableStorage, MemoryStorage, SqliteStorage, StorageError};
pub use sync::{BroadcastHub, PresenceSync, SyncEvent, SyncHandler, SyncMessage, TransportKind};
pub use tasks::{Task, TaskDraft, TaskStatus, TaskStore};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
