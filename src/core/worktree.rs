//! Worktree coordination: isolated per-stream workspaces and merge
//! conflict resolution.
//!
//! The core never touches files itself. All file access goes through the
//! [`WorkspaceAccess`] trait; the core consumes booleans and conflict
//! classifications, so it stays free of direct filesystem and
//! version-control dependencies. The shipped implementation shells out to
//! git, mirroring how workers' isolated worktrees are created.

use crate::core::bus::EventBus;
use crate::core::error::{Result, WeaverError};
use crate::core::events::{task_topic, Event, EventKind};
use crate::core::store::{TaskPatch, TaskStore};
use crate::core::task::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use uuid::Uuid;

/// Classification of a merge conflict on one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the same content.
    Content,
    /// One side deleted a file the other kept.
    Delete,
    /// One side renamed a file the other changed.
    Rename,
    /// Both sides added the same path.
    BothAdded,
    /// One side modified a file the other deleted.
    ModifyDelete,
}

impl ConflictKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Content => "both sides changed the same content",
            Self::Delete => "deleted on one side, kept on the other",
            Self::Rename => "renamed on one side, changed on the other",
            Self::BothAdded => "added independently on both sides",
            Self::ModifyDelete => "modified on one side, deleted on the other",
        }
    }
}

/// Resolution strategy for a blocked merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    /// Keep this stream's side for every conflicting file.
    Ours,
    /// Keep the other side for every conflicting file.
    Theirs,
    /// The caller already edited the files; validate and finish.
    Manual,
}

impl std::str::FromStr for ResolveStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown resolve strategy: {other}")),
        }
    }
}

/// Which side of a conflict to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Ours,
    Theirs,
}

/// A merge conflict finding attached to a blocked task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeConflict {
    /// Conflicting file path, relative to the workspace root.
    pub file: String,
    /// Conflict classification.
    pub kind: ConflictKind,
    /// Whether raw conflict markers were present at the last scan.
    pub markers_present: bool,
    /// Suggested resolution strategy.
    pub suggested: ResolveStrategy,
}

impl WorktreeConflict {
    /// Creates a content conflict with markers present.
    #[must_use]
    pub fn content(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            kind: ConflictKind::Content,
            markers_present: true,
            suggested: ResolveStrategy::Manual,
        }
    }

    /// Creates a conflict of the given kind.
    #[must_use]
    pub fn new(file: impl Into<String>, kind: ConflictKind, suggested: ResolveStrategy) -> Self {
        Self {
            file: file.into(),
            kind,
            markers_present: kind == ConflictKind::Content,
            suggested,
        }
    }
}

/// File access supplied by an external collaborator.
///
/// Operations are keyed by task id so one implementation can cover every
/// per-stream worktree.
pub trait WorkspaceAccess: Send + Sync {
    /// Whether the file still contains raw conflict markers.
    fn has_conflict_markers(&self, task_id: Uuid, file: &str) -> Result<bool>;

    /// Selects one side's content for a conflicting file and stages it.
    fn select_side(&self, task_id: Uuid, file: &str, side: Side) -> Result<()>;

    /// Completes the merge in progress for the task's workspace.
    fn complete_merge(&self, task_id: Uuid) -> Result<()>;

    /// Releases the isolated workspace.
    fn release(&self, task_id: Uuid) -> Result<()>;
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Release the isolated workspace after a successful resolve.
    pub release_on_resolve: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            release_on_resolve: true,
        }
    }
}

/// Per-conflict line in a status report.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictStatus {
    pub file: String,
    pub kind: ConflictKind,
    /// Re-scanned on every call, not cached from the merge attempt.
    pub markers_present: bool,
    pub summary: String,
    pub next_action: String,
}

/// Status report for a task blocked on a merge.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeStatus {
    pub task_id: Uuid,
    pub task_status: TaskStatus,
    pub conflicts: Vec<ConflictStatus>,
}

/// Coordinates merge outcomes for isolated workspaces.
pub struct WorktreeCoordinator {
    store: Arc<TaskStore>,
    workspace: Arc<dyn WorkspaceAccess>,
    bus: Arc<EventBus>,
    config: WorktreeConfig,
}

impl WorktreeCoordinator {
    /// Creates a coordinator over the given store and workspace.
    #[must_use]
    pub fn new(
        store: Arc<TaskStore>,
        workspace: Arc<dyn WorkspaceAccess>,
        bus: Arc<EventBus>,
        config: WorktreeConfig,
    ) -> Self {
        Self {
            store,
            workspace,
            bus,
            config,
        }
    }

    /// Records the outcome of a merge attempt.
    ///
    /// A clean merge completes the task. Conflicts block it with structured
    /// detail attached; resolution re-enters through [`Self::resolve`].
    pub fn report_merge(
        &self,
        task_id: Uuid,
        conflicts: Vec<WorktreeConflict>,
    ) -> Result<()> {
        let task = self.store.get(task_id)?;
        if task.status.is_terminal() {
            return Err(WeaverError::validation(
                "terminal_transition",
                format!("Task {task_id} is {} and cannot merge", task.status),
                "worktree:report_merge",
            ));
        }

        if conflicts.is_empty() {
            self.finish(task_id)?;
            return Ok(());
        }

        let files: Vec<&str> = conflicts.iter().map(|c| c.file.as_str()).collect();
        let reason = format!("merge conflicts in {}", files.join(", "));
        self.store.update(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Blocked),
                blocked_reason: Some(reason),
                conflicts: Some(conflicts.clone()),
                ..TaskPatch::default()
            },
        )?;

        self.bus.publish(&Event::new(
            task_topic(task_id),
            EventKind::MergeBlocked,
            json!({ "task_id": task_id, "conflicts": conflicts }),
        ));
        Ok(())
    }

    /// Reports each recorded conflict with a live marker re-scan.
    pub fn status(&self, task_id: Uuid) -> Result<WorktreeStatus> {
        let task = self.store.get(task_id)?;

        let mut conflicts = Vec::new();
        for conflict in &task.conflicts {
            let markers_present = self
                .workspace
                .has_conflict_markers(task_id, &conflict.file)?;
            let summary = format!("{}: {}", conflict.file, conflict.kind.describe());
            let next_action = if markers_present {
                format!(
                    "edit {} to remove conflict markers, or resolve with ours/theirs",
                    conflict.file
                )
            } else {
                "markers cleared; resolve with the manual strategy".to_string()
            };
            conflicts.push(ConflictStatus {
                file: conflict.file.clone(),
                kind: conflict.kind,
                markers_present,
                summary,
                next_action,
            });
        }

        Ok(WorktreeStatus {
            task_id,
            task_status: task.status,
            conflicts,
        })
    }

    /// Applies a resolution strategy to a blocked merge.
    ///
    /// `Manual` validates that no recorded conflict file still contains raw
    /// markers; the scan runs on every call, so repeated failed attempts
    /// are safe and idempotent.
    pub fn resolve(&self, task_id: Uuid, strategy: ResolveStrategy) -> Result<()> {
        let task = self.store.get(task_id)?;
        if task.status != TaskStatus::Blocked || task.conflicts.is_empty() {
            return Err(WeaverError::validation(
                "not_conflicted",
                format!("Task {task_id} has no merge conflicts to resolve"),
                "worktree:resolve",
            ));
        }

        match strategy {
            ResolveStrategy::Ours | ResolveStrategy::Theirs => {
                let side = if strategy == ResolveStrategy::Ours {
                    Side::Ours
                } else {
                    Side::Theirs
                };
                for conflict in &task.conflicts {
                    self.workspace.select_side(task_id, &conflict.file, side)?;
                }
            }
            ResolveStrategy::Manual => {
                let mut still_conflicted = Vec::new();
                let mut rescanned = task.conflicts.clone();
                for conflict in &mut rescanned {
                    conflict.markers_present = self
                        .workspace
                        .has_conflict_markers(task_id, &conflict.file)?;
                    if conflict.markers_present {
                        still_conflicted.push(conflict.file.clone());
                    }
                }

                if !still_conflicted.is_empty() {
                    // Refresh the recorded detail, but leave the task blocked.
                    self.store.update(
                        task_id,
                        TaskPatch {
                            conflicts: Some(rescanned),
                            ..TaskPatch::default()
                        },
                    )?;
                    return Err(WeaverError::conflict(
                        "markers_present",
                        format!(
                            "Conflict markers remain in: {}",
                            still_conflicted.join(", ")
                        ),
                        "worktree:resolve",
                    )
                    .with_context("files", still_conflicted.join(","))
                    .with_hint("Remove the markers, then resolve with manual again"));
                }
            }
        }

        self.finish(task_id)
    }

    /// Completes the merge, transitions the task to completed, clears the
    /// conflict metadata, and optionally releases the workspace.
    fn finish(&self, task_id: Uuid) -> Result<()> {
        self.workspace.complete_merge(task_id)?;
        self.store.update(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                conflicts: Some(Vec::new()),
                ..TaskPatch::default()
            },
        )?;
        if self.config.release_on_resolve {
            self.workspace.release(task_id)?;
        }

        self.bus.publish(&Event::new(
            task_topic(task_id),
            EventKind::MergeResolved,
            json!({ "task_id": task_id }),
        ));
        Ok(())
    }
}

/// Git-backed workspaces: one worktree per task under a base directory.
pub struct GitWorkspace {
    /// Main repository root (owns the worktree registrations).
    repo_root: PathBuf,
    /// Directory holding the per-task worktrees.
    base_dir: PathBuf,
}

impl GitWorkspace {
    /// Creates a workspace manager over existing git worktrees.
    #[must_use]
    pub fn new(repo_root: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            repo_root,
            base_dir,
        }
    }

    fn worktree_path(&self, task_id: Uuid) -> PathBuf {
        self.base_dir.join(task_id.to_string())
    }

    fn git(&self, cwd: &PathBuf, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .current_dir(cwd)
            .args(args)
            .output()
            .map_err(|e| {
                WeaverError::system("git_spawn_failed", e.to_string(), "worktree:git")
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WeaverError::system(
                "git_command_failed",
                stderr.trim().to_string(),
                "worktree:git",
            )
            .with_context("args", args.join(" ")));
        }
        Ok(())
    }
}

impl WorkspaceAccess for GitWorkspace {
    fn has_conflict_markers(&self, task_id: Uuid, file: &str) -> Result<bool> {
        let path = self.worktree_path(task_id).join(file);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            // A deleted side has no markers to scan.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(WeaverError::system(
                    "marker_scan_failed",
                    e.to_string(),
                    "worktree:scan",
                )
                .with_context("file", file))
            }
        };
        Ok(content
            .lines()
            .any(|line| line.starts_with("<<<<<<< ") || line.starts_with(">>>>>>> ")))
    }

    fn select_side(&self, task_id: Uuid, file: &str, side: Side) -> Result<()> {
        let flag = match side {
            Side::Ours => "--ours",
            Side::Theirs => "--theirs",
        };
        let cwd = self.worktree_path(task_id);
        self.git(&cwd, &["checkout", flag, "--", file])?;
        self.git(&cwd, &["add", "--", file])
    }

    fn complete_merge(&self, task_id: Uuid) -> Result<()> {
        self.git(
            &self.worktree_path(task_id),
            &["-c", "core.editor=true", "commit", "--no-edit"],
        )
    }

    fn release(&self, task_id: Uuid) -> Result<()> {
        let path = self.worktree_path(task_id).to_string_lossy().to_string();
        self.git(
            &self.repo_root,
            &["worktree", "remove", "--force", &path],
        )
    }
}
