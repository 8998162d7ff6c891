//! File-level conflict detection between streams.
//!
//! A file is claimed by a stream while any of that stream's non-terminal
//! tasks declares it. Checks are advisory at declaration time (before a
//! parallel stream starts) and authoritative at merge time (used by the
//! worktree coordinator).

use crate::core::task::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single detected claim on a candidate file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClaim {
    /// The contested file path.
    pub file: String,
    /// Stream currently claiming the file.
    pub stream_id: String,
    /// Task within that stream declaring the file.
    pub task_id: Uuid,
    /// Status of the claiming task.
    pub task_status: TaskStatus,
}

/// Checks `candidate_files` against the files claimed by other streams.
///
/// Only active (non-terminal) tasks of streams other than
/// `excluding_stream` are considered. Returns one claim per (file, task)
/// overlap, ordered by file then stream.
#[must_use]
pub fn check(
    tasks: &[Task],
    candidate_files: &[String],
    excluding_stream: Option<&str>,
) -> Vec<FileClaim> {
    let mut claims = Vec::new();

    for candidate in candidate_files {
        for task in tasks {
            if task.status.is_terminal() {
                continue;
            }
            let Some(stream_id) = task.meta.stream_id() else {
                continue;
            };
            if excluding_stream == Some(stream_id) {
                continue;
            }
            if task.meta.files().iter().any(|f| f == candidate) {
                claims.push(FileClaim {
                    file: candidate.clone(),
                    stream_id: stream_id.to_string(),
                    task_id: task.id,
                    task_status: task.status,
                });
            }
        }
    }

    claims.sort_by(|a, b| (&a.file, &a.stream_id).cmp(&(&b.file, &b.stream_id)));
    claims
}
