// Event stream entities emitted during skill execution
//
// Four event kinds (status, message, error, done) tagged with a visibility
// level. The bus delivers to each subscriber the events at or below its
// declared level; ordering is FIFO per task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_kind::ErrorKind;

/// Audience classification for an event.
///
/// Levels are ordered: `Summary < Detail < Full`. A subscriber at level L
/// receives every event whose visibility is `<= L`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// End-user safe: state transitions, final answers, user-safe errors
    #[default]
    Summary,
    /// Developer detail: per-iteration progress, tool-call summaries, retries
    Detail,
    /// Audit: everything, including reasoning-chain snapshots
    Full,
}

/// Lifecycle state of an execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Working,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Working)
    }
}

/// A structured part of a progress message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum MessagePart {
    Text(String),
    Json(serde_json::Value),
}

/// Events emitted during skill execution.
///
/// Every event carries the task id, an optional tenant id, a visibility
/// level, and a timestamp. Events for one task are delivered in emission
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// State transition for the task
    Status {
        task_id: Uuid,
        tenant_id: Option<String>,
        state: TaskState,
        message: Option<String>,
        visibility: Visibility,
        timestamp: DateTime<Utc>,
    },

    /// Progress text and/or structured parts
    Message {
        task_id: Uuid,
        tenant_id: Option<String>,
        parts: Vec<MessagePart>,
        visibility: Visibility,
        timestamp: DateTime<Utc>,
    },

    /// An error with a recovery hint
    Error {
        task_id: Uuid,
        tenant_id: Option<String>,
        kind: ErrorKind,
        message: String,
        recoverable: bool,
        hint: Option<String>,
        visibility: Visibility,
        timestamp: DateTime<Utc>,
    },

    /// Terminal marker; always the last event for a task
    Done {
        task_id: Uuid,
        tenant_id: Option<String>,
        final_state: TaskState,
        visibility: Visibility,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Create a status event.
    pub fn status(task_id: Uuid, state: TaskState) -> Self {
        ExecutionEvent::Status {
            task_id,
            tenant_id: None,
            state,
            message: None,
            visibility: Visibility::Summary,
            timestamp: Utc::now(),
        }
    }

    /// Create a status event with a human-readable message.
    pub fn status_with_message(task_id: Uuid, state: TaskState, message: impl Into<String>) -> Self {
        ExecutionEvent::Status {
            task_id,
            tenant_id: None,
            state,
            message: Some(message.into()),
            visibility: Visibility::Summary,
            timestamp: Utc::now(),
        }
    }

    /// Create a text message event at the given visibility.
    pub fn message(task_id: Uuid, visibility: Visibility, text: impl Into<String>) -> Self {
        ExecutionEvent::Message {
            task_id,
            tenant_id: None,
            parts: vec![MessagePart::Text(text.into())],
            visibility,
            timestamp: Utc::now(),
        }
    }

    /// Create a message event from structured parts.
    pub fn message_parts(task_id: Uuid, visibility: Visibility, parts: Vec<MessagePart>) -> Self {
        ExecutionEvent::Message {
            task_id,
            tenant_id: None,
            parts,
            visibility,
            timestamp: Utc::now(),
        }
    }

    /// Create an error event.
    pub fn error(
        task_id: Uuid,
        kind: ErrorKind,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        ExecutionEvent::Error {
            task_id,
            tenant_id: None,
            kind,
            message: message.into(),
            recoverable,
            hint: None,
            visibility: Visibility::Summary,
            timestamp: Utc::now(),
        }
    }

    /// Create a terminal done event.
    pub fn done(task_id: Uuid, final_state: TaskState) -> Self {
        ExecutionEvent::Done {
            task_id,
            tenant_id: None,
            final_state,
            visibility: Visibility::Summary,
            timestamp: Utc::now(),
        }
    }

    /// Attach a tenant id.
    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        match &mut self {
            ExecutionEvent::Status { tenant_id, .. }
            | ExecutionEvent::Message { tenant_id, .. }
            | ExecutionEvent::Error { tenant_id, .. }
            | ExecutionEvent::Done { tenant_id, .. } => *tenant_id = tenant,
        }
        self
    }

    /// Override the visibility level.
    pub fn with_visibility(mut self, level: Visibility) -> Self {
        match &mut self {
            ExecutionEvent::Status { visibility, .. }
            | ExecutionEvent::Message { visibility, .. }
            | ExecutionEvent::Error { visibility, .. }
            | ExecutionEvent::Done { visibility, .. } => *visibility = level,
        }
        self
    }

    /// Attach a recovery hint (error events only; no-op otherwise).
    pub fn with_hint(mut self, new_hint: impl Into<String>) -> Self {
        if let ExecutionEvent::Error { hint, .. } = &mut self {
            *hint = Some(new_hint.into());
        }
        self
    }

    /// Get the task id for this event.
    pub fn task_id(&self) -> Uuid {
        match self {
            ExecutionEvent::Status { task_id, .. }
            | ExecutionEvent::Message { task_id, .. }
            | ExecutionEvent::Error { task_id, .. }
            | ExecutionEvent::Done { task_id, .. } => *task_id,
        }
    }

    /// Get the visibility level for this event.
    pub fn visibility(&self) -> Visibility {
        match self {
            ExecutionEvent::Status { visibility, .. }
            | ExecutionEvent::Message { visibility, .. }
            | ExecutionEvent::Error { visibility, .. }
            | ExecutionEvent::Done { visibility, .. } => *visibility,
        }
    }

    /// Whether this is the terminal done event.
    pub fn is_done(&self) -> bool {
        matches!(self, ExecutionEvent::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_ordering() {
        assert!(Visibility::Summary < Visibility::Detail);
        assert!(Visibility::Detail < Visibility::Full);
    }

    #[test]
    fn test_event_tagging() {
        let task_id = Uuid::now_v7();
        let event = ExecutionEvent::status(task_id, TaskState::Working);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "WORKING");
    }

    #[test]
    fn test_with_tenant_and_visibility() {
        let task_id = Uuid::now_v7();
        let event = ExecutionEvent::message(task_id, Visibility::Detail, "iteration 1 starting")
            .with_tenant(Some("acme".to_string()));

        assert_eq!(event.visibility(), Visibility::Detail);
        if let ExecutionEvent::Message { tenant_id, .. } = &event {
            assert_eq!(tenant_id.as_deref(), Some("acme"));
        } else {
            panic!("expected message event");
        }
    }

    #[test]
    fn test_message_part_round_trip() {
        let part = MessagePart::Json(serde_json::json!({"count": 3}));
        let json = serde_json::to_string(&part).unwrap();
        let parsed: MessagePart = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, part);
    }

    #[test]
    fn test_done_is_terminal() {
        let event = ExecutionEvent::done(Uuid::now_v7(), TaskState::Completed);
        assert!(event.is_done());
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::Working.is_terminal());
    }
}
