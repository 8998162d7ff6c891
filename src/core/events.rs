//! Domain event definitions.
//!
//! Events are immutable notifications fanned out by the bus. They are not
//! the system of record; the task store is. Only a short in-memory window
//! is retained for catch-up display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type discriminator. Serialized under its dotted wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.status_changed")]
    TaskStatusChanged,
    #[serde(rename = "task.blocked")]
    TaskBlocked,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "stream.progress")]
    StreamProgress,
    #[serde(rename = "stream.blocked")]
    StreamBlocked,
    #[serde(rename = "stream.completed")]
    StreamCompleted,
    #[serde(rename = "checkpoint.created")]
    CheckpointCreated,
    #[serde(rename = "worktree.merge_blocked")]
    MergeBlocked,
    #[serde(rename = "worktree.merge_resolved")]
    MergeResolved,
}

impl EventKind {
    /// Dotted wire name, e.g. `task.status_changed`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task.created",
            Self::TaskUpdated => "task.updated",
            Self::TaskStatusChanged => "task.status_changed",
            Self::TaskBlocked => "task.blocked",
            Self::TaskCompleted => "task.completed",
            Self::StreamProgress => "stream.progress",
            Self::StreamBlocked => "stream.blocked",
            Self::StreamCompleted => "stream.completed",
            Self::CheckpointCreated => "checkpoint.created",
            Self::MergeBlocked => "worktree.merge_blocked",
            Self::MergeResolved => "worktree.merge_resolved",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,
    /// Topic string in `kind:id` form, matched against subscriber patterns.
    pub topic: String,
    /// Event type.
    pub kind: EventKind,
    /// Structured payload.
    pub payload: Value,
    /// Publish timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Topic for a single task.
#[must_use]
pub fn task_topic(task_id: Uuid) -> String {
    format!("task:{task_id}")
}

/// Topic for a single stream.
#[must_use]
pub fn stream_topic(stream_id: &str) -> String {
    format!("stream:{stream_id}")
}
