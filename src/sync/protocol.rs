//! Wire format for presence and task sync messages.
//!
//! Every message is a flat JSON object:
//!
//! ```json
//! {"type": "taskCompleted", "senderId": "peer_...", "timestampMs": 1718000000000, "taskId": 7, "completedAt": "..."}
//! ```
//!
//! [`SyncMessage`] is the envelope as sent; [`SyncEvent`] is the typed view
//! of the built-in message types. Custom types stay as raw envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const HEARTBEAT: &str = "heartbeat";
pub const USER_JOINED: &str = "userJoined";
pub const USER_LEFT: &str = "userLeft";
pub const TASK_CREATED: &str = "taskCreated";
pub const TASK_UPDATED: &str = "taskUpdated";
pub const TASK_DELETED: &str = "taskDeleted";
pub const TASK_COMPLETED: &str = "taskCompleted";
pub const TASK_ARCHIVED: &str = "taskArchived";

/// Message types handled without a registered handler.
pub const BUILTIN_KINDS: &[&str] = &[
    HEARTBEAT,
    USER_JOINED,
    USER_LEFT,
    TASK_CREATED,
    TASK_UPDATED,
    TASK_DELETED,
    TASK_COMPLETED,
    TASK_ARCHIVED,
];

pub fn is_builtin(kind: &str) -> bool {
    BUILTIN_KINDS.contains(&kind)
}

// ── Envelope ────────────────────────────────────────────────────

/// A message as it travels between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Stamped by the sender. Messages without it are never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub timestamp_ms: u64,
    /// Type-specific fields, flattened into the top-level object.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl SyncMessage {
    /// An unstamped message.
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            sender_id: None,
            timestamp_ms: 0,
            payload,
        }
    }

    /// A message of a custom type. Object payloads are flattened; anything
    /// else is carried under `data`.
    pub fn custom(kind: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        Self::new(kind, payload)
    }

    /// Set sender and timestamp (keeps an existing timestamp).
    pub fn stamp(&mut self, sender_id: &str, now_ms: u64) {
        self.sender_id = Some(sender_id.to_string());
        if self.timestamp_ms == 0 {
            self.timestamp_ms = now_ms;
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

// ── Typed events ────────────────────────────────────────────────

/// Built-in message types with their decoded payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SyncEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "userJoined")]
    UserJoined,
    #[serde(rename = "userLeft")]
    UserLeft,
    #[serde(rename = "taskCreated")]
    TaskCreated { task: Value },
    #[serde(rename = "taskUpdated")]
    TaskUpdated { task: Value },
    #[serde(rename = "taskDeleted")]
    TaskDeleted {
        #[serde(rename = "taskId")]
        task_id: u64,
    },
    #[serde(rename = "taskCompleted")]
    TaskCompleted {
        #[serde(rename = "taskId")]
        task_id: u64,
        #[serde(rename = "completedAt", default)]
        completed_at: Option<String>,
    },
    #[serde(rename = "taskArchived")]
    TaskArchived {
        #[serde(rename = "taskId")]
        task_id: u64,
    },
}

impl SyncEvent {
    /// Decode a built-in message. `Ok(None)` for custom types.
    pub fn from_message(message: &SyncMessage) -> serde_json::Result<Option<Self>> {
        if !is_builtin(&message.kind) {
            return Ok(None);
        }
        let mut object = message.payload.clone();
        object.insert("type".into(), Value::String(message.kind.clone()));
        serde_json::from_value(Value::Object(object)).map(Some)
    }

    /// Build an unstamped envelope.
    pub fn into_message(self) -> SyncMessage {
        let mut object = match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => self.kind().to_string(),
        };
        SyncMessage::new(kind, object)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat => HEARTBEAT,
            Self::UserJoined => USER_JOINED,
            Self::UserLeft => USER_LEFT,
            Self::TaskCreated { .. } => TASK_CREATED,
            Self::TaskUpdated { .. } => TASK_UPDATED,
            Self::TaskDeleted { .. } => TASK_DELETED,
            Self::TaskCompleted { .. } => TASK_COMPLETED,
            Self::TaskArchived { .. } => TASK_ARCHIVED,
        }
    }
}
