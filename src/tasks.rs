//! Garden tasks and their sealed persistence.
//!
//! Active and archived tasks live in two lists, each stored as one sealed
//! value (`gartenplaner_tasks`, `gartenplaner_archived_tasks`). Lists
//! written by older versions as plain JSON arrays are read as-is and sealed
//! on the next save.

use crate::reporting::{ErrorKind, ErrorReport, ErrorReporter};
use crate::security::validation::{sanitize_text, validate_storage_data};
use crate::security::EncryptionAtRest;
use crate::storage::{DurableStorage, StorageError, ARCHIVED_TASKS_KEY, TASKS_KEY};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Keys written together by every save, in write order.
const LIST_KEYS: [&str; 2] = [TASKS_KEY, ARCHIVED_TASKS_KEY];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }

    /// Parse a status, defaulting to `Pending` for anything unknown.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "in-progress" => Self::InProgress,
            "completed" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planner task as stored and exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub employee: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
    // Carried through untouched; edited by other clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Value>,
}

/// User input for creating or editing a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub title: String,
    pub employee: String,
    pub location: String,
    pub description: String,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub due_date: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    let value = sanitize_text(value);
    (!value.is_empty()).then_some(value)
}

impl Task {
    /// A new pending task from validated input.
    pub fn from_draft(id: u64, draft: &TaskDraft, now: DateTime<Utc>) -> Self {
        let mut task = Self {
            id,
            title: String::new(),
            employee: String::new(),
            location: String::new(),
            description: String::new(),
            status: TaskStatus::Pending,
            created_at: now,
            completed_at: None,
            archived_at: None,
            priority: None,
            due_date: None,
            sort_order: None,
            history: None,
            subtasks: None,
            recurrence: None,
        };
        task.apply_draft(draft, now);
        task
    }

    /// Overwrite the editable fields. Status changes keep `completed_at`
    /// consistent.
    pub fn apply_draft(&mut self, draft: &TaskDraft, now: DateTime<Utc>) {
        self.title = sanitize_text(Some(draft.title.as_str()));
        self.employee = sanitize_text(Some(draft.employee.as_str()));
        self.location = sanitize_text(Some(draft.location.as_str()));
        self.description = sanitize_text(Some(draft.description.as_str()));
        if let Some(priority) = non_empty(draft.priority.as_deref()) {
            self.priority = Some(priority);
        }
        if let Some(due) = non_empty(draft.due_date.as_deref()) {
            self.due_date = Some(due);
        }
        if let Some(status) = non_empty(draft.status.as_deref()) {
            self.set_status(TaskStatus::from_str_lossy(&status), now);
        }
    }

    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        match (self.status, status) {
            (TaskStatus::Completed, TaskStatus::Completed) => {}
            (_, TaskStatus::Completed) => self.completed_at = Some(now),
            _ => self.completed_at = None,
        }
        self.status = status;
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Where a task currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskList {
    Active,
    Archived,
}

#[derive(Debug, Clone, Default)]
pub struct TaskLists {
    pub active: Vec<Task>,
    pub archived: Vec<Task>,
}

impl TaskLists {
    pub fn find(&self, id: u64) -> Option<(TaskList, &Task)> {
        if let Some(task) = self.active.iter().find(|t| t.id == id) {
            return Some((TaskList::Active, task));
        }
        self.archived.iter().find(|t| t.id == id).map(|t| (TaskList::Archived, t))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.find(id).is_some()
    }

    pub fn active_mut(&mut self, id: u64) -> Option<&mut Task> {
        self.active.iter_mut().find(|t| t.id == id)
    }

    /// Move an active task to the archive. Returns the archived copy.
    pub fn archive(&mut self, id: u64, now: DateTime<Utc>) -> Option<Task> {
        let pos = self.active.iter().position(|t| t.id == id)?;
        let mut task = self.active.remove(pos);
        task.archived_at = Some(now);
        self.archived.push(task.clone());
        Some(task)
    }

    /// Move an archived task back to the active list.
    pub fn restore(&mut self, id: u64) -> Option<Task> {
        let pos = self.archived.iter().position(|t| t.id == id)?;
        let mut task = self.archived.remove(pos);
        task.archived_at = None;
        self.active.push(task.clone());
        Some(task)
    }

    /// Remove a task from whichever list holds it.
    pub fn remove(&mut self, id: u64) -> Option<Task> {
        if let Some(pos) = self.active.iter().position(|t| t.id == id) {
            return Some(self.active.remove(pos));
        }
        let pos = self.archived.iter().position(|t| t.id == id)?;
        Some(self.archived.remove(pos))
    }

    /// Insert or replace by id, keeping the task in the list its
    /// `archived_at` says it belongs to.
    pub fn upsert(&mut self, task: Task) {
        self.remove(task.id);
        if task.archived_at.is_some() {
            self.archived.push(task);
        } else {
            self.active.push(task);
        }
    }

    /// Active tasks in display order: explicit sort order first, then
    /// creation time.
    pub fn sorted_active(&self) -> Vec<Task> {
        let mut tasks = self.active.clone();
        tasks.sort_by(|a, b| {
            let key = |t: &Task| (t.sort_order.unwrap_or(i64::MAX), t.created_at, t.id);
            key(a).cmp(&key(b))
        });
        tasks
    }
}

/// In-memory task lists backed by sealed storage.
pub struct TaskStore {
    storage: Arc<dyn DurableStorage>,
    encryption: Arc<EncryptionAtRest>,
    reporter: Arc<dyn ErrorReporter>,
    lists: Mutex<TaskLists>,
}

impl TaskStore {
    pub fn new(
        storage: Arc<dyn DurableStorage>,
        encryption: Arc<EncryptionAtRest>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            storage,
            encryption,
            reporter,
            lists: Mutex::new(TaskLists::default()),
        }
    }

    /// Replace the in-memory lists with what storage holds.
    pub fn load(&self) -> anyhow::Result<()> {
        let active = self.read_list(TASKS_KEY)?;
        let archived = self.read_list(ARCHIVED_TASKS_KEY)?;
        tracing::debug!(active = active.len(), archived = archived.len(), "Loaded tasks");
        *self.lists.lock() = TaskLists { active, archived };
        Ok(())
    }

    fn read_list(&self, key: &str) -> anyhow::Result<Vec<Task>> {
        let Some(raw) = self.storage.get(key)? else {
            return Ok(Vec::new());
        };
        let Some(value) = self.encryption.unseal_str(&raw) else {
            anyhow::bail!("'{key}' is unreadable with the current encryption key");
        };
        serde_json::from_value(value).with_context(|| format!("'{key}' does not hold a task list"))
    }

    /// Write both lists as one unit. They are sealed and stored while the
    /// encryption key is held. If a later key cannot be written, keys
    /// already written get their previous bytes back.
    fn write_lists(&self, lists: &TaskLists) -> anyhow::Result<()> {
        let values = [
            serde_json::to_value(&lists.active).context("serializing active tasks")?,
            serde_json::to_value(&lists.archived).context("serializing archived tasks")?,
        ];
        self.encryption.seal_and_write(&values, |sealed| {
            let mut staged = Vec::with_capacity(LIST_KEYS.len());
            for (key, sealed) in LIST_KEYS.into_iter().zip(sealed) {
                let raw = sealed.to_json().to_string();
                if let Err(e) = validate_storage_data(key, &raw) {
                    self.reporter
                        .report(ErrorReport::new(ErrorKind::Validation, "TaskStore::save", e.to_string()));
                    return Err(e.into());
                }
                let previous = match self.storage.get(key) {
                    Ok(previous) => previous,
                    Err(e) => {
                        self.report_storage(&e, key);
                        return Err(e).with_context(|| format!("reading '{key}' before save"));
                    }
                };
                staged.push((key, raw, previous));
            }

            for (done, (key, raw, _)) in staged.iter().enumerate() {
                if let Err(e) = self.storage.set(key, raw) {
                    self.report_storage(&e, key);
                    self.restore(&staged[..done]);
                    return Err(e).with_context(|| format!("saving '{key}'"));
                }
            }
            Ok(())
        })
    }

    fn restore(&self, written: &[(&str, String, Option<String>)]) {
        for (key, _, previous) in written {
            let restored = match previous {
                Some(raw) => self.storage.set(key, raw),
                None => self.storage.remove(key),
            };
            if let Err(e) = restored {
                self.reporter.report(
                    ErrorReport::new(ErrorKind::Storage, "TaskStore::save", format!("Failed to restore '{key}': {e}"))
                        .with_context(serde_json::json!({ "key": key })),
                );
            }
        }
    }

    fn report_storage(&self, e: &StorageError, key: &str) {
        let kind = if e.is_quota() {
            ErrorKind::Quota
        } else {
            ErrorKind::Storage
        };
        self.reporter.report(
            ErrorReport::new(kind, "TaskStore::save", e.to_string()).with_context(serde_json::json!({ "key": key })),
        );
    }

    /// Persist the current lists.
    pub fn save(&self) -> anyhow::Result<()> {
        let lists = self.lists.lock();
        self.write_lists(&lists)
    }

    /// Apply `change` and persist the result. If `change` or the save
    /// fails, the previous lists are kept.
    pub fn commit<R>(&self, change: impl FnOnce(&mut TaskLists) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let mut lists = self.lists.lock();
        let mut next = lists.clone();
        let result = change(&mut next)?;
        self.write_lists(&next)?;
        *lists = next;
        Ok(result)
    }

    /// Like [`Self::commit`], but `change` reports whether anything changed
    /// and nothing is written when it did not.
    pub fn commit_if_changed(&self, change: impl FnOnce(&mut TaskLists) -> bool) -> anyhow::Result<bool> {
        let mut lists = self.lists.lock();
        let mut next = lists.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.write_lists(&next)?;
        *lists = next;
        Ok(true)
    }

    /// Active tasks in display order.
    pub fn tasks(&self) -> Vec<Task> {
        self.lists.lock().sorted_active()
    }

    pub fn archived(&self) -> Vec<Task> {
        self.lists.lock().archived.clone()
    }

    pub fn get(&self, id: u64) -> Option<(TaskList, Task)> {
        self.lists.lock().find(id).map(|(list, task)| (list, task.clone()))
    }

    /// An id not used by any task: the current time in ms, bumped past the
    /// largest existing id if needed. Fails once `u64::MAX` is taken.
    pub fn next_id(&self) -> anyhow::Result<u64> {
        let lists = self.lists.lock();
        let max = lists.active.iter().chain(lists.archived.iter()).map(|t| t.id).max().unwrap_or(0);
        let after = max
            .checked_add(1)
            .with_context(|| format!("No task id left after {max}"))?;
        Ok(crate::now_ms().max(after))
    }
}
