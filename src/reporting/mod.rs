//! Central error reporting hook.
//!
//! Every component that swallows a failure and picks a safe fallback
//! (plaintext sealing, fail-open admission, dropped broadcasts) still hands
//! the failure to an [`ErrorReporter`]. Only rate-limit denials propagate
//! to callers.
//!
//! ## Design
//! - [`TracingReporter`] logs and forgets
//! - [`ErrorLog`] keeps a bounded history, persists it and runs storage
//!   recovery when a write hits the quota

pub mod error_log;

pub use error_log::ErrorLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Error taxonomy ──────────────────────────────────────────────

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Broadcast transport could not send or open.
    Transport,
    /// Rate limit denial or storage quota exhaustion.
    Quota,
    /// Key handling, sealing or unsealing failed.
    Crypto,
    /// Durable storage read or write failed.
    Storage,
    /// Internal fault (e.g. limiter state unusable).
    Runtime,
    /// Host input rejected.
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Quota => "quota",
            Self::Crypto => "crypto",
            Self::Storage => "storage",
            Self::Runtime => "runtime",
            Self::Validation => "validation",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "transport" => Self::Transport,
            "quota" => Self::Quota,
            "crypto" => Self::Crypto,
            "storage" => Self::Storage,
            "validation" => Self::Validation,
            _ => Self::Runtime,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reported failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    /// Operation that failed (e.g. `"seal"`, `"broadcast"`).
    #[serde(default)]
    pub function: String,
    /// Free-form structured details.
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, function: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            function: function.to_string(),
            context: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

// ── Reporter trait ──────────────────────────────────────────────

/// The single sink for swallowed failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Reporter that only emits a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        log_report(&report);
    }
}

/// Emit `report` at a level matching its kind.
pub(crate) fn log_report(report: &ErrorReport) {
    match report.kind {
        ErrorKind::Crypto | ErrorKind::Storage | ErrorKind::Runtime => tracing::error!(
            kind = %report.kind,
            function = %report.function,
            context = %report.context,
            "{}",
            report.message
        ),
        ErrorKind::Transport | ErrorKind::Quota | ErrorKind::Validation => tracing::warn!(
            kind = %report.kind,
            function = %report.function,
            context = %report.context,
            "{}",
            report.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            ErrorKind::Transport,
            ErrorKind::Quota,
            ErrorKind::Crypto,
            ErrorKind::Storage,
            ErrorKind::Runtime,
            ErrorKind::Validation,
        ] {
            assert_eq!(ErrorKind::from_str_lossy(kind.as_str()), kind);
        }
        assert_eq!(ErrorKind::from_str_lossy("bogus"), ErrorKind::Runtime);
    }

    #[test]
    fn report_serializes_with_type_field() {
        let report = ErrorReport::new(ErrorKind::Crypto, "unseal", "data unreadable")
            .with_context(serde_json::json!({"key": "gartenplaner_tasks"}));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["type"], "crypto");
        assert_eq!(value["function"], "unseal");
        assert_eq!(value["context"]["key"], "gartenplaner_tasks");
    }

    #[test]
    fn report_deserializes_with_defaults() {
        let report: ErrorReport =
            serde_json::from_str(r#"{"type":"storage","message":"disk full"}"#).unwrap();
        assert_eq!(report.kind, ErrorKind::Storage);
        assert!(report.function.is_empty());
        assert!(report.context.is_null());
    }

    #[test]
    fn tracing_reporter_accepts_reports() {
        TracingReporter.report(ErrorReport::new(ErrorKind::Transport, "send", "closed"));
    }
}
