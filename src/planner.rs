//! The planner host: task operations wired through admission control,
//! sealed storage and peer sync.
//!
//! Every local operation follows the same path:
//!
//! 1. validate input (rejections are reported as `validation`)
//! 2. admit through the category's quota; a failed operation is rolled back
//! 3. mutate the lists and persist them sealed, all-or-nothing
//! 4. broadcast the change to other peers
//!
//! Inbound changes from other peers are applied idempotently: a task that
//! is already present is not created twice, a missing one is not deleted.

use crate::config::Config;
use crate::reporting::{ErrorKind, ErrorLog, ErrorReport, ErrorReporter};
use crate::security::validation::validate_task;
use crate::security::{AdmissionController, EncryptionAtRest, DEFAULT_IDENTIFIER};
use crate::storage::DurableStorage;
use crate::sync::{BroadcastHub, PresenceSync, SyncHandler};
use crate::tasks::{Task, TaskDraft, TaskList, TaskLists, TaskStatus, TaskStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

pub const CREATE_CATEGORY: &str = "taskCreate";
pub const EDIT_CATEGORY: &str = "taskEdit";
pub const DELETE_CATEGORY: &str = "taskDelete";

pub struct Planner {
    store: TaskStore,
    limiter: Arc<AdmissionController>,
    encryption: Arc<EncryptionAtRest>,
    presence: Arc<PresenceSync>,
    errors: Arc<ErrorLog>,
}

impl Planner {
    /// Assemble a planner from ready components and register it as the
    /// presence handler.
    pub fn new(
        store: TaskStore,
        limiter: Arc<AdmissionController>,
        encryption: Arc<EncryptionAtRest>,
        presence: Arc<PresenceSync>,
        errors: Arc<ErrorLog>,
    ) -> Arc<Self> {
        let planner = Arc::new(Self {
            store,
            limiter,
            encryption,
            presence,
            errors,
        });
        let handler: Arc<dyn SyncHandler> = planner.clone();
        planner.presence.set_handler(Arc::downgrade(&handler));
        planner
    }

    /// Build every component from `config` on top of `storage` and load the
    /// stored tasks. Nothing is started.
    pub fn open(config: &Config, storage: Arc<dyn DurableStorage>, hub: Option<BroadcastHub>) -> anyhow::Result<Arc<Self>> {
        let errors = Arc::new(ErrorLog::new(storage.clone()));
        let reporter: Arc<dyn ErrorReporter> = errors.clone();

        let limiter = Arc::new(AdmissionController::from_config(&config.limits, reporter.clone())?);
        let encryption = Arc::new(EncryptionAtRest::new(
            storage.clone(),
            reporter.clone(),
            config.encryption.clone(),
        ));
        if encryption.is_available() {
            if let Err(e) = encryption.ensure_key() {
                tracing::warn!(error = %e, "Continuing without encryption key");
            }
        }
        let presence = Arc::new(PresenceSync::new(
            config.presence.clone(),
            storage.clone(),
            hub,
            reporter.clone(),
        ));

        let store = TaskStore::new(storage, encryption.clone(), reporter);
        store.load().context("Failed to load tasks")?;

        Ok(Self::new(store, limiter, encryption, presence, errors))
    }

    /// Start limiter cleanup and join the presence roster.
    pub fn start(&self) {
        self.limiter.start_cleanup();
        self.presence.start();
    }

    /// Leave the roster and stop background work. Idempotent.
    pub fn stop(&self) {
        self.presence.stop();
        self.limiter.stop_cleanup();
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.store.tasks()
    }

    pub fn archived(&self) -> Vec<Task> {
        self.store.archived()
    }

    pub fn get(&self, id: u64) -> Option<(TaskList, Task)> {
        self.store.get(id)
    }

    pub fn limiter(&self) -> &Arc<AdmissionController> {
        &self.limiter
    }

    pub fn encryption(&self) -> &Arc<EncryptionAtRest> {
        &self.encryption
    }

    pub fn presence(&self) -> &Arc<PresenceSync> {
        &self.presence
    }

    pub fn errors(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    // ── Local operations ────────────────────────────────────────

    pub fn create_task(&self, draft: &TaskDraft) -> anyhow::Result<Task> {
        self.validate(draft, "create_task")?;
        let task = self.limiter.with_limit_sync(CREATE_CATEGORY, DEFAULT_IDENTIFIER, || {
            let task = Task::from_draft(self.store.next_id()?, draft, Utc::now());
            self.store.commit(|lists| {
                lists.active.push(task.clone());
                Ok(())
            })?;
            Ok(task)
        })?;

        tracing::info!(task_id = task.id, "Task created");
        self.presence.broadcast_task_created(&task);
        Ok(task)
    }

    pub fn update_task(&self, id: u64, draft: &TaskDraft) -> anyhow::Result<Task> {
        self.validate(draft, "update_task")?;
        let task = self.limiter.with_limit_sync(EDIT_CATEGORY, DEFAULT_IDENTIFIER, || {
            self.store.commit(|lists| {
                let task = active_task(lists, id)?;
                task.apply_draft(draft, Utc::now());
                Ok(task.clone())
            })
        })?;

        tracing::info!(task_id = id, "Task updated");
        self.presence.broadcast_task_updated(&task);
        Ok(task)
    }

    /// Mark an active task completed. Completing a completed task keeps its
    /// original completion time.
    pub fn complete_task(&self, id: u64) -> anyhow::Result<Task> {
        let task = self.limiter.with_limit_sync(EDIT_CATEGORY, DEFAULT_IDENTIFIER, || {
            self.store.commit(|lists| {
                let task = active_task(lists, id)?;
                task.set_status(TaskStatus::Completed, Utc::now());
                Ok(task.clone())
            })
        })?;

        tracing::info!(task_id = id, "Task completed");
        self.presence
            .broadcast_task_completed(id, task.completed_at.map(|at| at.to_rfc3339()));
        Ok(task)
    }

    /// Put a completed task back to pending.
    pub fn reopen_task(&self, id: u64) -> anyhow::Result<Task> {
        let task = self.limiter.with_limit_sync(EDIT_CATEGORY, DEFAULT_IDENTIFIER, || {
            self.store.commit(|lists| {
                let task = active_task(lists, id)?;
                task.set_status(TaskStatus::Pending, Utc::now());
                Ok(task.clone())
            })
        })?;

        tracing::info!(task_id = id, "Task reopened");
        self.presence.broadcast_task_updated(&task);
        Ok(task)
    }

    pub fn archive_task(&self, id: u64) -> anyhow::Result<Task> {
        let task = self.limiter.with_limit_sync(EDIT_CATEGORY, DEFAULT_IDENTIFIER, || {
            self.store.commit(|lists| {
                lists
                    .archive(id, Utc::now())
                    .with_context(|| format!("No active task with id {id}"))
            })
        })?;

        tracing::info!(task_id = id, "Task archived");
        self.presence.broadcast_task_archived(id);
        Ok(task)
    }

    /// Move an archived task back to the active list.
    pub fn restore_task(&self, id: u64) -> anyhow::Result<Task> {
        let task = self.limiter.with_limit_sync(EDIT_CATEGORY, DEFAULT_IDENTIFIER, || {
            self.store.commit(|lists| {
                lists
                    .restore(id)
                    .with_context(|| format!("No archived task with id {id}"))
            })
        })?;

        tracing::info!(task_id = id, "Task restored");
        self.presence.broadcast_task_updated(&task);
        Ok(task)
    }

    /// Delete a task from the active list or the archive.
    pub fn delete_task(&self, id: u64) -> anyhow::Result<Task> {
        let task = self.limiter.with_limit_sync(DELETE_CATEGORY, DEFAULT_IDENTIFIER, || {
            self.store.commit(|lists| {
                lists
                    .remove(id)
                    .with_context(|| format!("No task with id {id}"))
            })
        })?;

        tracing::info!(task_id = id, "Task deleted");
        self.presence.broadcast_task_deleted(id);
        Ok(task)
    }

    fn validate(&self, draft: &TaskDraft, function: &str) -> anyhow::Result<()> {
        if let Err(e) = validate_task(draft) {
            self.errors.report(
                ErrorReport::new(ErrorKind::Validation, function, e.to_string())
                    .with_context(serde_json::json!({ "errors": e.messages() })),
            );
            return Err(e.into());
        }
        Ok(())
    }

    // ── Remote changes ──────────────────────────────────────────

    fn apply_remote(&self, kind: &str, task_id: u64, change: impl FnOnce(&mut TaskLists) -> bool) {
        match self.store.commit_if_changed(change) {
            Ok(true) => tracing::info!(kind, task_id, "Applied remote change"),
            Ok(false) => tracing::debug!(kind, task_id, "Remote change already applied"),
            Err(e) => tracing::warn!(kind, task_id, error = %e, "Failed to apply remote change"),
        }
    }

    fn decode_task(&self, value: &Value, kind: &str) -> Option<Task> {
        match serde_json::from_value::<Task>(value.clone()) {
            // The largest id would leave no room for local ids after it.
            Ok(task) if task.id == u64::MAX => {
                self.errors.report(
                    ErrorReport::new(ErrorKind::Validation, "Planner::apply_remote", format!("Task id out of range in {kind}"))
                        .with_context(serde_json::json!({ "taskId": task.id })),
                );
                None
            }
            Ok(task) => Some(task),
            Err(e) => {
                self.errors.report(
                    ErrorReport::new(ErrorKind::Validation, "Planner::apply_remote", format!("Invalid task in {kind}: {e}"))
                        .with_context(value.clone()),
                );
                None
            }
        }
    }
}

fn active_task(lists: &mut TaskLists, id: u64) -> anyhow::Result<&mut Task> {
    lists
        .active_mut(id)
        .with_context(|| format!("No active task with id {id}"))
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc))
}

impl SyncHandler for Planner {
    fn on_task_created(&self, task: &Value) {
        let Some(task) = self.decode_task(task, "taskCreated") else {
            return;
        };
        self.apply_remote("taskCreated", task.id, |lists| {
            if lists.contains(task.id) {
                return false;
            }
            lists.upsert(task);
            true
        });
    }

    fn on_task_updated(&self, task: &Value) {
        let Some(task) = self.decode_task(task, "taskUpdated") else {
            return;
        };
        self.apply_remote("taskUpdated", task.id, |lists| {
            if lists.find(task.id).is_some_and(|(_, current)| *current == task) {
                return false;
            }
            lists.upsert(task);
            true
        });
    }

    fn on_task_deleted(&self, task_id: u64) {
        self.apply_remote("taskDeleted", task_id, |lists| lists.remove(task_id).is_some());
    }

    fn on_task_completed(&self, task_id: u64, completed_at: Option<&str>) {
        let at = parse_time(completed_at).unwrap_or_else(Utc::now);
        self.apply_remote("taskCompleted", task_id, |lists| match lists.active_mut(task_id) {
            Some(task) if !task.is_completed() => {
                task.set_status(TaskStatus::Completed, at);
                true
            }
            _ => false,
        });
    }

    fn on_task_archived(&self, task_id: u64) {
        self.apply_remote("taskArchived", task_id, |lists| lists.archive(task_id, Utc::now()).is_some());
    }

    fn on_peer_joined(&self, peer_id: &str) {
        tracing::info!(peer_id, peers = self.presence.active_count(), "Peer joined the planner");
    }

    fn on_peer_left(&self, peer_id: &str) {
        tracing::info!(peer_id, peers = self.presence.active_count(), "Peer left the planner");
    }
}

impl Drop for Planner {
    fn drop(&mut self) {
        self.stop();
    }
}
