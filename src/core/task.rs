//! Task model: the unit of work tracked by the store.
//!
//! A task is created `Pending` and moves through a caller-driven state
//! machine. `Completed` and `Cancelled` are terminal; once terminal, no
//! further transitions are accepted.

use crate::core::worktree::WorktreeConflict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up.
    Pending,
    /// A worker is executing the task.
    InProgress,
    /// Stopped on an obstacle; carries a non-empty reason.
    Blocked,
    /// Finished successfully. Terminal.
    Completed,
    /// Abandoned. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status accepts no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Blocked => write!(f, "blocked"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Position of a stream in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    /// No dependencies; runs first.
    Foundation,
    /// Depends only on foundation streams; runs isolated in parallel.
    Parallel,
    /// Depends on parallel streams; merges their output.
    Integration,
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Foundation => write!(f, "foundation"),
            Self::Parallel => write!(f, "parallel"),
            Self::Integration => write!(f, "integration"),
        }
    }
}

impl std::str::FromStr for StreamPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "foundation" => Ok(Self::Foundation),
            "parallel" => Ok(Self::Parallel),
            "integration" => Ok(Self::Integration),
            other => Err(format!("unknown stream phase: {other}")),
        }
    }
}

/// Stream metadata as a closed sum type.
///
/// The dependency and conflict logic operates on an exhaustively-checked
/// shape, never on optional untyped fields. A task belongs to at most one
/// stream by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum TaskMeta {
    /// Task not attached to any stream.
    #[default]
    Unscoped,
    /// Task belongs to a stream.
    StreamScoped {
        /// Owning stream id.
        stream_id: String,
        /// Declared phase of the owning stream.
        phase: StreamPhase,
        /// File paths this task will touch.
        #[serde(default)]
        files: Vec<String>,
        /// Stream ids the owning stream depends on.
        #[serde(default)]
        depends_on: Vec<String>,
    },
}

impl TaskMeta {
    /// Returns the stream id, if stream-scoped.
    #[must_use]
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::Unscoped => None,
            Self::StreamScoped { stream_id, .. } => Some(stream_id),
        }
    }

    /// Returns the declared files, if stream-scoped.
    #[must_use]
    pub fn files(&self) -> &[String] {
        match self {
            Self::Unscoped => &[],
            Self::StreamScoped { files, .. } => files,
        }
    }

    /// Returns the declared stream dependencies, if stream-scoped.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Unscoped => &[],
            Self::StreamScoped { depends_on, .. } => depends_on,
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: Uuid,
    /// Parent task for subtask nesting.
    pub parent_id: Option<Uuid>,
    /// Human-readable title.
    pub title: String,
    /// Current status.
    pub status: TaskStatus,
    /// Reason the task is blocked. Present iff status is `Blocked`.
    pub blocked_reason: Option<String>,
    /// Worker that claimed the task.
    pub agent: Option<String>,
    /// Stream metadata.
    #[serde(default)]
    pub meta: TaskMeta,
    /// Merge conflicts recorded while blocked on a worktree merge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<WorktreeConflict>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new pending task.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            title: title.into(),
            status: TaskStatus::Pending,
            blocked_reason: None,
            agent: None,
            meta: TaskMeta::Unscoped,
            conflicts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the parent task.
    #[must_use]
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets the claiming agent.
    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Sets the stream metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: TaskMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Checks whether a status transition is accepted.
    ///
    /// Terminal states accept nothing. `Blocked` requires a reason, which is
    /// validated by the store, not here.
    #[must_use]
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        !self.status.is_terminal() && self.status != new_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_reject_transitions() {
        let mut task = Task::new("t");
        task.status = TaskStatus::Completed;
        assert!(!task.can_transition_to(TaskStatus::InProgress));
        assert!(!task.can_transition_to(TaskStatus::Pending));

        task.status = TaskStatus::Cancelled;
        assert!(!task.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn non_terminal_statuses_transition() {
        let task = Task::new("t");
        assert!(task.can_transition_to(TaskStatus::InProgress));
        assert!(task.can_transition_to(TaskStatus::Cancelled));
        assert!(!task.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn meta_accessors() {
        let meta = TaskMeta::StreamScoped {
            stream_id: "stream-a".to_string(),
            phase: StreamPhase::Parallel,
            files: vec!["src/a.rs".to_string()],
            depends_on: vec!["stream-base".to_string()],
        };
        assert_eq!(meta.stream_id(), Some("stream-a"));
        assert_eq!(meta.files(), ["src/a.rs".to_string()]);
        assert_eq!(meta.depends_on(), ["stream-base".to_string()]);

        assert_eq!(TaskMeta::Unscoped.stream_id(), None);
        assert!(TaskMeta::Unscoped.files().is_empty());
    }

    #[test]
    fn meta_round_trips_through_json() {
        let meta = TaskMeta::StreamScoped {
            stream_id: "auth".to_string(),
            phase: StreamPhase::Foundation,
            files: Vec::new(),
            depends_on: Vec::new(),
        };
        let json = serde_json::to_string(&meta).expect("serialize");
        assert!(json.contains("stream_scoped"));
        let restored: TaskMeta = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, meta);
    }
}
