//! Coordinator: wires the components together behind one facade.
//!
//! Single coordinating process, single source of truth. The event bus is
//! injected into every component; nothing reaches for ambient globals.

use crate::core::bus::{EventBus, LivenessConfig};
use crate::core::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointTrigger, CleanupFilter, CreateCheckpoint,
    ResumeState,
};
use crate::core::conflict::{self, FileClaim};
use crate::core::error::{Result, WeaverError};
use crate::core::store::{NewTask, StoreWrite, TaskFilter, TaskStore, TaskPatch};
use crate::core::stream::{Stream, StreamRegistry};
use crate::core::task::{Task, TaskStatus};
use crate::core::worktree::{
    GitWorkspace, ResolveStrategy, WorkspaceAccess, WorktreeConfig, WorktreeConflict,
    WorktreeCoordinator, WorktreeStatus,
};
use crate::storage::{DirKv, InMemoryKv, KvStore};
use fs2::FileExt;
use serde::Serialize;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Base directory for weaver data.
    pub data_dir: PathBuf,
    /// Worktree behavior.
    pub worktree: WorktreeConfig,
}

impl CoordinatorConfig {
    /// Creates a config with the default data directory.
    #[must_use]
    pub fn default_dir() -> Self {
        if let Ok(data_dir) = env::var("WEAVER_DATA_DIR") {
            return Self::with_dir(PathBuf::from(data_dir));
        }

        let data_dir =
            dirs::home_dir().map_or_else(|| PathBuf::from(".weaver"), |h| h.join(".weaver"));
        Self::with_dir(data_dir)
    }

    /// Creates a config with a custom data directory.
    #[must_use]
    pub fn with_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            worktree: WorktreeConfig::default(),
        }
    }

    /// Path to the key/value store root.
    #[must_use]
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("kv")
    }

    /// Path to the advisory lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("weaver.lock")
    }
}

/// One worker's current activity, for the polling query surface.
#[derive(Debug, Clone, Serialize)]
pub struct AgentActivity {
    pub agent: String,
    pub task_id: Uuid,
    pub task_title: String,
    pub stream_id: Option<String>,
    pub status: TaskStatus,
}

/// The coordination core.
pub struct Coordinator {
    bus: Arc<EventBus>,
    streams: Arc<StreamRegistry>,
    store: Arc<TaskStore>,
    checkpoints: CheckpointManager,
    worktrees: WorktreeCoordinator,
    // Held for the process lifetime; dropped (and unlocked) with the
    // coordinator.
    _dir_lock: Option<File>,
}

impl Coordinator {
    /// Opens the coordinator over the default data directory.
    pub fn open() -> Result<Self> {
        Self::open_with_config(CoordinatorConfig::default_dir())
    }

    /// Opens the coordinator over a specific data directory.
    ///
    /// Takes an advisory lock on the directory: the core is a single
    /// coordinating process, and a second one must fail loudly.
    pub fn open_with_config(config: CoordinatorConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).map_err(|e| {
            WeaverError::storage("data_dir_create_failed", e.to_string(), "coordinator:open")
                .with_context("path", config.data_dir.display().to_string())
        })?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(config.lock_path())
            .map_err(|e| {
                WeaverError::storage("lock_open_failed", e.to_string(), "coordinator:open")
            })?;
        lock_file.try_lock_exclusive().map_err(|_| {
            WeaverError::storage(
                "data_dir_locked",
                "Another weaver process holds the data directory",
                "coordinator:open",
            )
            .with_hint("Stop the other process or point WEAVER_DATA_DIR elsewhere")
        })?;

        let kv: Arc<dyn KvStore> = Arc::new(DirKv::open(config.kv_path())?);
        let workspace: Arc<dyn WorkspaceAccess> = Arc::new(GitWorkspace::new(
            PathBuf::from("."),
            config.data_dir.join("worktrees"),
        ));
        Self::assemble(kv, workspace, config.worktree, Some(lock_file))
    }

    /// Opens an in-memory coordinator with a caller-supplied workspace.
    ///
    /// Used by tests and by embedders that provide their own persistence.
    pub fn open_in_memory(workspace: Arc<dyn WorkspaceAccess>) -> Result<Self> {
        Self::assemble(
            Arc::new(InMemoryKv::new()),
            workspace,
            WorktreeConfig::default(),
            None,
        )
    }

    fn assemble(
        kv: Arc<dyn KvStore>,
        workspace: Arc<dyn WorkspaceAccess>,
        worktree_config: WorktreeConfig,
        dir_lock: Option<File>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let streams = Arc::new(StreamRegistry::new(Arc::clone(&bus)));
        let store = Arc::new(TaskStore::open(
            Arc::clone(&kv),
            Arc::clone(&bus),
            Arc::clone(&streams),
        )?);
        let checkpoints = CheckpointManager::new(Arc::clone(&kv), Arc::clone(&bus));
        let worktrees = WorktreeCoordinator::new(
            Arc::clone(&store),
            workspace,
            Arc::clone(&bus),
            worktree_config,
        );

        Ok(Self {
            bus,
            streams,
            store,
            checkpoints,
            worktrees,
            _dir_lock: dir_lock,
        })
    }

    /// The injected event bus (for transports that register connections).
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ---- task operations -------------------------------------------------

    /// Creates a task.
    pub fn create_task(&self, new: NewTask) -> Result<StoreWrite> {
        self.store.create(new)
    }

    /// Updates a task. A status change additionally writes an automatic
    /// checkpoint so the task can be resumed after a crash.
    pub fn update_task(&self, task_id: Uuid, patch: TaskPatch) -> Result<StoreWrite> {
        let status_changing = patch.status.is_some();
        let write = self.store.update(task_id, patch)?;

        if status_changing && !write.task.status.is_terminal() {
            self.checkpoints.create(
                task_id,
                CheckpointTrigger::AutoStatusChange,
                CreateCheckpoint {
                    phase: Some(write.task.status.to_string()),
                    ..CreateCheckpoint::default()
                },
            )?;
        }
        Ok(write)
    }

    /// Returns a task by id.
    pub fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.store.get(task_id)
    }

    /// Lists tasks matching the filter.
    #[must_use]
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store.list(filter)
    }

    // ---- stream operations -----------------------------------------------

    /// Snapshot of all streams.
    #[must_use]
    pub fn list_streams(&self) -> Vec<Stream> {
        self.streams.snapshot(&self.store.snapshot())
    }

    /// Detail for one stream, including its member tasks.
    pub fn get_stream(&self, stream_id: &str) -> Result<(Stream, Vec<Task>)> {
        let stream = self
            .streams
            .get(stream_id, &self.store.snapshot())
            .ok_or_else(|| {
                WeaverError::not_found(
                    "unknown_stream",
                    format!("No stream with id {stream_id}"),
                    "coordinator:get_stream",
                )
                .with_context("stream_id", stream_id)
            })?;
        let tasks = self.store.list(&TaskFilter {
            stream: Some(stream_id.to_string()),
            ..TaskFilter::default()
        });
        Ok((stream, tasks))
    }

    /// Checks a candidate file set against other streams' claims.
    #[must_use]
    pub fn check_conflicts(
        &self,
        candidate_files: &[String],
        excluding_stream: Option<&str>,
    ) -> Vec<FileClaim> {
        conflict::check(&self.store.snapshot(), candidate_files, excluding_stream)
    }

    /// Current activity of all agents with a non-terminal task.
    #[must_use]
    pub fn agent_activity(&self) -> Vec<AgentActivity> {
        let mut activity: Vec<AgentActivity> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .filter_map(|t| {
                let agent = t.agent.clone()?;
                Some(AgentActivity {
                    agent,
                    task_id: t.id,
                    task_title: t.title.clone(),
                    stream_id: t.meta.stream_id().map(ToString::to_string),
                    status: t.status,
                })
            })
            .collect();
        activity.sort_by(|a, b| a.agent.cmp(&b.agent).then(a.task_id.cmp(&b.task_id)));
        activity
    }

    // ---- checkpoint operations -------------------------------------------

    /// Creates a checkpoint for a task.
    pub fn create_checkpoint(
        &self,
        task_id: Uuid,
        trigger: CheckpointTrigger,
        params: CreateCheckpoint,
    ) -> Result<Checkpoint> {
        // The task must exist; a checkpoint for an unknown task would be
        // unreachable garbage.
        self.store.get(task_id)?;
        self.checkpoints.create(task_id, trigger, params)
    }

    /// Resumes a task from a checkpoint, including its subtask rollup.
    pub fn resume_checkpoint(
        &self,
        task_id: Uuid,
        checkpoint_id: Option<Uuid>,
    ) -> Result<ResumeState> {
        self.store.get(task_id)?;
        let subtasks = self.store.children(task_id);
        self.checkpoints.resume(task_id, checkpoint_id, &subtasks)
    }

    /// Lists recent checkpoints for a task, newest first.
    pub fn list_checkpoints(&self, task_id: Uuid, limit: usize) -> Result<Vec<Checkpoint>> {
        self.store.get(task_id)?;
        self.checkpoints.list(task_id, limit)
    }

    /// Deletes checkpoints matching the filter.
    pub fn cleanup_checkpoints(&self, filter: &CleanupFilter) -> Result<usize> {
        self.checkpoints.cleanup(filter)
    }

    // ---- worktree operations ---------------------------------------------

    /// Records a merge attempt's outcome for an isolated task.
    pub fn report_merge(&self, task_id: Uuid, conflicts: Vec<WorktreeConflict>) -> Result<()> {
        self.worktrees.report_merge(task_id, conflicts)
    }

    /// Conflict status for a task, with a live marker re-scan.
    pub fn worktree_status(&self, task_id: Uuid) -> Result<WorktreeStatus> {
        self.worktrees.status(task_id)
    }

    /// Resolves a blocked merge with the given strategy.
    pub fn resolve_worktree(&self, task_id: Uuid, strategy: ResolveStrategy) -> Result<()> {
        self.worktrees.resolve(task_id, strategy)
    }

    // ---- maintenance -----------------------------------------------------

    /// Periodic maintenance: purge expired checkpoints and sweep dead bus
    /// connections. Safe to run concurrently with normal traffic.
    pub fn maintenance(&self, liveness: LivenessConfig) -> Result<usize> {
        let purged = self.checkpoints.purge_expired()?;
        self.bus.sweep(liveness);
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{StreamPhase, TaskMeta};
    use tempfile::tempdir;

    #[test]
    fn second_process_cannot_take_the_data_dir() {
        let tmp = tempdir().expect("tempdir");
        let config = CoordinatorConfig::with_dir(tmp.path().join("data"));

        let first = Coordinator::open_with_config(config.clone()).expect("first open");
        let err = Coordinator::open_with_config(config)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.code, "data_dir_locked");
        drop(first);
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = tempdir().expect("tempdir");
        let config = CoordinatorConfig::with_dir(tmp.path().join("data"));

        let task_id = {
            let coordinator =
                Coordinator::open_with_config(config.clone()).expect("open");
            coordinator
                .create_task(NewTask {
                    title: "durable".to_string(),
                    meta: TaskMeta::StreamScoped {
                        stream_id: "s".to_string(),
                        phase: StreamPhase::Foundation,
                        files: Vec::new(),
                        depends_on: Vec::new(),
                    },
                    ..NewTask::default()
                })
                .unwrap()
                .task
                .id
        };

        let coordinator = Coordinator::open_with_config(config).expect("reopen");
        assert_eq!(coordinator.get_task(task_id).unwrap().title, "durable");
        assert_eq!(coordinator.list_streams().len(), 1);
    }

    #[test]
    fn status_change_writes_an_automatic_checkpoint() {
        let tmp = tempdir().expect("tempdir");
        let coordinator =
            Coordinator::open_with_config(CoordinatorConfig::with_dir(tmp.path().join("d")))
                .expect("open");

        let task = coordinator
            .create_task(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;
        coordinator
            .update_task(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..TaskPatch::default()
                },
            )
            .unwrap();

        let checkpoints = coordinator.list_checkpoints(task.id, 10).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(
            checkpoints[0].trigger,
            CheckpointTrigger::AutoStatusChange
        );
        assert_eq!(checkpoints[0].phase.as_deref(), Some("in_progress"));
    }

    #[test]
    fn unknown_stream_detail_is_not_found() {
        let tmp = tempdir().expect("tempdir");
        let coordinator =
            Coordinator::open_with_config(CoordinatorConfig::with_dir(tmp.path().join("d")))
                .expect("open");
        let err = coordinator.get_stream("ghost").unwrap_err();
        assert_eq!(err.code, "unknown_stream");
    }
}
