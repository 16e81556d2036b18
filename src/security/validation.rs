//! Input validation and escaping for task data.
//!
//! Lengths are counted in characters after trimming, so a title of only
//! whitespace is empty.

use crate::storage::DEFAULT_QUOTA_BYTES;
use crate::tasks::TaskDraft;

/// Allowed task statuses.
pub const VALID_STATUSES: &[&str] = &["pending", "in-progress", "completed"];

/// Allowed task priorities.
pub const VALID_PRIORITIES: &[&str] = &["low", "medium", "high"];

const TITLE_MAX: usize = 200;
const DESCRIPTION_MAX: usize = 2000;
const NAME_MAX: usize = 100;

/// Rejected host input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// One or more task fields are invalid.
    #[error("invalid task: {}", .0.join("; "))]
    InvalidTask(Vec<String>),
    #[error("invalid id '{0}': only letters, digits, '_' and '-' are allowed")]
    InvalidId(String),
    #[error("storage data for '{key}' is not valid JSON: {reason}")]
    InvalidJson { key: String, reason: String },
    #[error("storage data for '{key}' is {size} bytes, limit is {limit}")]
    TooLarge { key: String, size: usize, limit: usize },
}

impl ValidationError {
    /// Individual messages (one per failed field for task errors).
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::InvalidTask(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Whether `value` (trimmed) has between `min` and `max` characters.
pub fn text_in_range(value: &str, min: usize, max: usize) -> bool {
    let len = value.trim().chars().count();
    (min..=max).contains(&len)
}

/// Whether `value` parses as an RFC 3339 timestamp or a calendar date.
pub fn is_valid_date(value: &str) -> bool {
    let value = value.trim();
    chrono::DateTime::parse_from_rfc3339(value).is_ok()
        || chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M").is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
}

/// Check every field of a task draft, collecting all failures.
pub fn validate_task(draft: &TaskDraft) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if !text_in_range(&draft.title, 1, TITLE_MAX) {
        errors.push(format!("Title must be between 1 and {TITLE_MAX} characters"));
    }
    if !text_in_range(&draft.description, 0, DESCRIPTION_MAX) {
        errors.push(format!("Description must be at most {DESCRIPTION_MAX} characters"));
    }
    if !text_in_range(&draft.employee, 1, NAME_MAX) {
        errors.push("Employee is required".to_string());
    }
    if !text_in_range(&draft.location, 1, NAME_MAX) {
        errors.push("Location is required".to_string());
    }
    if let Some(due) = draft.due_date.as_deref().filter(|d| !d.is_empty()) {
        if !is_valid_date(due) {
            errors.push(format!("Invalid due date '{due}'"));
        }
    }
    if let Some(status) = draft.status.as_deref().filter(|s| !s.is_empty()) {
        if !VALID_STATUSES.contains(&status) {
            errors.push(format!("Invalid status '{status}'"));
        }
    }
    if let Some(priority) = draft.priority.as_deref().filter(|p| !p.is_empty()) {
        if !VALID_PRIORITIES.contains(&priority) {
            errors.push(format!("Invalid priority '{priority}'"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::InvalidTask(errors))
    }
}

/// Whether `value` is a non-empty identifier of `[A-Za-z0-9_-]`.
pub fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Escape HTML special characters.
pub fn escape_html(unsafe_text: &str) -> String {
    let mut out = String::with_capacity(unsafe_text.len());
    for c in unsafe_text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

/// Trim free text; `None` becomes empty.
pub fn sanitize_text(text: Option<&str>) -> String {
    text.map(str::trim).unwrap_or_default().to_string()
}

/// Check that `data` is JSON and fits in the browser storage budget.
pub fn validate_storage_data(key: &str, data: &str) -> Result<(), ValidationError> {
    if let Err(e) = serde_json::from_str::<serde_json::Value>(data) {
        return Err(ValidationError::InvalidJson {
            key: key.to_string(),
            reason: e.to_string(),
        });
    }
    if data.len() > DEFAULT_QUOTA_BYTES {
        return Err(ValidationError::TooLarge {
            key: key.to_string(),
            size: data.len(),
            limit: DEFAULT_QUOTA_BYTES,
        });
    }
    Ok(())
}
