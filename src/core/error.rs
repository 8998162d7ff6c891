//! Structured error types.
//!
//! Errors must be classifiable, attributable, and actionable.
//! Every error answers: What failed? Why? What can be done next?

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected input: invalid transition, missing field, cyclic graph.
    Validation,
    /// Merge conflicts or markers still present; task stays blocked.
    Conflict,
    /// Unknown task/stream/checkpoint id.
    NotFound,
    /// Persistence layer failure. The only fatal class.
    Storage,
    /// Everything else (IO outside storage, serialization at the edges).
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not_found"),
            Self::Storage => write!(f, "storage"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Structured error with full context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaverError {
    /// Error category for classification.
    pub category: ErrorCategory,
    /// Unique error code within category.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Component and identifier that originated the error.
    pub origin: String,
    /// Whether this error is potentially recoverable.
    pub recoverable: bool,
    /// Hint for recovery action.
    pub recovery_hint: Option<String>,
    /// Additional context key-value pairs.
    pub context: HashMap<String, String>,
}

impl WeaverError {
    /// Creates a new error with the given parameters.
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            origin: origin.into(),
            recoverable: false,
            recovery_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets whether the error is recoverable.
    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Sets the recovery hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Creates a validation error. No state change occurred.
    #[must_use]
    pub fn validation(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Validation, code, message, origin).recoverable(true)
    }

    /// Creates a conflict error. The task remains blocked with detail attached.
    #[must_use]
    pub fn conflict(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Conflict, code, message, origin).recoverable(true)
    }

    /// Creates a not-found error, never silently an empty result.
    #[must_use]
    pub fn not_found(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::NotFound, code, message, origin)
    }

    /// Creates a storage error. Fatal: never fallback-handled.
    #[must_use]
    pub fn storage(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Storage, code, message, origin)
    }

    /// Creates a system error.
    #[must_use]
    pub fn system(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::System, code, message, origin)
    }
}

impl std::fmt::Display for WeaverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for WeaverError {}

impl From<crate::storage::StorageError> for WeaverError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self::storage("storage_failure", e.to_string(), "storage:kv")
    }
}

/// Result type using `WeaverError`.
pub type Result<T> = std::result::Result<T, WeaverError>;

/// Exit codes for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    NotFound = 2,
    Conflict = 3,
    Validation = 4,
}

impl ExitCode {
    /// Maps an error to its CLI exit code.
    #[must_use]
    pub fn from_error(err: &WeaverError) -> Self {
        match err.category {
            ErrorCategory::Validation => Self::Validation,
            ErrorCategory::Conflict => Self::Conflict,
            ErrorCategory::NotFound => Self::NotFound,
            ErrorCategory::Storage | ErrorCategory::System => Self::Error,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WeaverError::storage("write_failed", "Failed to persist task", "storage:dir");
        assert!(err.to_string().contains("storage"));
        assert!(err.to_string().contains("write_failed"));
    }

    #[test]
    fn error_with_context() {
        let err = WeaverError::validation(
            "missing_blocked_reason",
            "Transition to blocked requires a reason",
            "store:update",
        )
        .with_context("field", "blocked_reason")
        .with_hint("Provide a non-empty blocked reason");

        assert_eq!(
            err.context.get("field"),
            Some(&"blocked_reason".to_string())
        );
        assert!(err.recovery_hint.is_some());
        assert!(err.recoverable);
    }

    #[test]
    fn error_serialization() {
        let err = WeaverError::not_found("unknown_task", "No such task", "store:get")
            .with_context("task_id", "4a1c");

        let json = serde_json::to_string(&err).expect("serialize");
        let restored: WeaverError = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.category, ErrorCategory::NotFound);
        assert_eq!(restored.code, "unknown_task");
    }

    #[test]
    fn exit_code_mapping() {
        let err = WeaverError::conflict("markers_present", "Markers remain", "worktree:resolve");
        assert_eq!(ExitCode::from_error(&err), ExitCode::Conflict);
        assert_eq!(i32::from(ExitCode::Conflict), 3);
    }
}
