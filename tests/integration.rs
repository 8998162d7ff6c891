//! Integration tests for Weaver.
//!
//! Exercise the coordinator facade end to end: task writes flowing into
//! derived streams, checkpoint pause/resume, and merge conflict resolution
//! against a fake workspace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use weaver::core::checkpoint::{CheckpointTrigger, CreateCheckpoint, PAUSED_PHASE};
use weaver::core::coordinator::{Coordinator, CoordinatorConfig};
use weaver::core::error::Result;
use weaver::core::store::{NewTask, TaskFilter, TaskPatch};
use weaver::core::task::{StreamPhase, TaskMeta, TaskStatus};
use weaver::core::worktree::{
    ConflictKind, ResolveStrategy, Side, WorkspaceAccess, WorktreeConflict,
};

/// In-memory workspace standing in for git worktrees.
#[derive(Default)]
struct FakeWorkspace {
    /// Files that still contain conflict markers, per task.
    markers: Mutex<HashMap<(Uuid, String), bool>>,
}

impl FakeWorkspace {
    fn set_markers(&self, task_id: Uuid, file: &str, present: bool) {
        self.markers
            .lock()
            .expect("markers lock")
            .insert((task_id, file.to_string()), present);
    }
}

impl WorkspaceAccess for FakeWorkspace {
    fn has_conflict_markers(&self, task_id: Uuid, file: &str) -> Result<bool> {
        Ok(self
            .markers
            .lock()
            .expect("markers lock")
            .get(&(task_id, file.to_string()))
            .copied()
            .unwrap_or(false))
    }

    fn select_side(&self, task_id: Uuid, file: &str, _side: Side) -> Result<()> {
        self.set_markers(task_id, file, false);
        Ok(())
    }

    fn complete_merge(&self, _task_id: Uuid) -> Result<()> {
        Ok(())
    }

    fn release(&self, _task_id: Uuid) -> Result<()> {
        Ok(())
    }
}

fn coordinator() -> (Coordinator, Arc<FakeWorkspace>) {
    let workspace = Arc::new(FakeWorkspace::default());
    let coordinator =
        Coordinator::open_in_memory(Arc::clone(&workspace) as Arc<dyn WorkspaceAccess>)
            .expect("coordinator");
    (coordinator, workspace)
}

fn scoped_task(
    title: &str,
    stream_id: &str,
    phase: StreamPhase,
    files: &[&str],
    depends_on: &[&str],
) -> NewTask {
    NewTask {
        title: title.to_string(),
        meta: TaskMeta::StreamScoped {
            stream_id: stream_id.to_string(),
            phase,
            files: files.iter().map(ToString::to_string).collect(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
        },
        ..NewTask::default()
    }
}

fn complete(coordinator: &Coordinator, task_id: Uuid) {
    coordinator
        .update_task(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                ..TaskPatch::default()
            },
        )
        .expect("complete task");
}

#[test]
fn foundation_stream_gates_its_dependents() {
    let (coordinator, _) = coordinator();

    let t1 = coordinator
        .create_task(scoped_task(
            "schema",
            "stream-a",
            StreamPhase::Foundation,
            &[],
            &[],
        ))
        .unwrap()
        .task;
    let t2 = coordinator
        .create_task(scoped_task(
            "migrations",
            "stream-a",
            StreamPhase::Foundation,
            &[],
            &[],
        ))
        .unwrap()
        .task;
    coordinator
        .create_task(scoped_task(
            "api",
            "stream-b",
            StreamPhase::Parallel,
            &[],
            &["stream-a"],
        ))
        .unwrap();

    let (stream_b, _) = coordinator.get_stream("stream-b").unwrap();
    assert!(!stream_b.ready, "dependent starts gated");

    complete(&coordinator, t1.id);
    let (stream_b, _) = coordinator.get_stream("stream-b").unwrap();
    assert!(!stream_b.ready, "half-done dependency still gates");

    complete(&coordinator, t2.id);
    let (stream_a, _) = coordinator.get_stream("stream-a").unwrap();
    assert_eq!(stream_a.progress_pct, 100);
    let (stream_b, _) = coordinator.get_stream("stream-b").unwrap();
    assert!(stream_b.ready, "fully complete dependency releases the gate");
}

#[test]
fn file_claims_are_visible_before_a_stream_starts() {
    let (coordinator, _) = coordinator();

    coordinator
        .create_task(scoped_task(
            "token refresh",
            "stream-a",
            StreamPhase::Parallel,
            &["src/auth/token.ts", "src/auth/session.ts"],
            &[],
        ))
        .unwrap();

    let claims = coordinator.check_conflicts(
        &["src/auth/token.ts".to_string(), "src/ui/nav.ts".to_string()],
        Some("stream-b"),
    );
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].file, "src/auth/token.ts");
    assert_eq!(claims[0].stream_id, "stream-a");

    // Completing the claiming task releases the claim.
    let claimant = coordinator
        .list_tasks(&TaskFilter {
            stream: Some("stream-a".to_string()),
            ..TaskFilter::default()
        })
        .remove(0);
    complete(&coordinator, claimant.id);
    assert!(coordinator
        .check_conflicts(&["src/auth/token.ts".to_string()], Some("stream-b"))
        .is_empty());
}

#[test]
fn cycle_rejection_leaves_the_graph_unchanged() {
    let (coordinator, _) = coordinator();

    coordinator
        .create_task(scoped_task("a", "stream-a", StreamPhase::Parallel, &[], &["stream-b"]))
        .unwrap();
    coordinator
        .create_task(scoped_task("b", "stream-b", StreamPhase::Parallel, &[], &[]))
        .unwrap();

    let err = coordinator
        .create_task(scoped_task(
            "b2",
            "stream-b",
            StreamPhase::Parallel,
            &[],
            &["stream-a"],
        ))
        .unwrap_err();
    assert_eq!(err.code, "dependency_cycle");

    // Both streams still derive exactly as before the rejected write.
    assert_eq!(coordinator.list_streams().len(), 2);
    let (stream_b, tasks) = coordinator.get_stream("stream-b").unwrap();
    assert_eq!(stream_b.total, 1);
    assert_eq!(tasks.len(), 1);
}

#[test]
fn pause_and_resume_round_trip() {
    let (coordinator, _) = coordinator();

    let task = coordinator
        .create_task(NewTask {
            title: "long migration".to_string(),
            ..NewTask::default()
        })
        .unwrap()
        .task;

    // Work starts; the status change writes an automatic checkpoint.
    coordinator
        .update_task(
            task.id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                ..TaskPatch::default()
            },
        )
        .unwrap();

    // Deliberate pause with a draft in flight.
    let paused = coordinator
        .create_checkpoint(
            task.id,
            CheckpointTrigger::Manual,
            CreateCheckpoint {
                phase: Some(PAUSED_PHASE.to_string()),
                step: Some("table 3 of 7".to_string()),
                draft: Some(("ALTER TABLE users ...".to_string(), Some("sql".to_string()))),
                ..CreateCheckpoint::default()
            },
        )
        .unwrap();

    // More automatic churn after the pause.
    coordinator
        .create_checkpoint(
            task.id,
            CheckpointTrigger::AutoSubtaskChange,
            CreateCheckpoint::default(),
        )
        .unwrap();

    let resumed = coordinator.resume_checkpoint(task.id, None).unwrap();
    assert_eq!(resumed.checkpoint.id, paused.id, "pause point wins over recency");
    assert!(!resumed.fallback);
    assert_eq!(resumed.checkpoint.step.as_deref(), Some("table 3 of 7"));
    assert_eq!(
        resumed.draft_preview.as_deref(),
        Some("ALTER TABLE users ...")
    );
}

#[test]
fn resume_rolls_up_subtask_progress() {
    let (coordinator, _) = coordinator();

    let parent = coordinator
        .create_task(NewTask {
            title: "epic".to_string(),
            ..NewTask::default()
        })
        .unwrap()
        .task;
    let sub1 = coordinator
        .create_task(NewTask {
            title: "part 1".to_string(),
            parent_id: Some(parent.id),
            ..NewTask::default()
        })
        .unwrap()
        .task;
    coordinator
        .create_task(NewTask {
            title: "part 2".to_string(),
            parent_id: Some(parent.id),
            ..NewTask::default()
        })
        .unwrap();
    complete(&coordinator, sub1.id);

    coordinator
        .create_checkpoint(
            parent.id,
            CheckpointTrigger::Manual,
            CreateCheckpoint::default(),
        )
        .unwrap();

    let resumed = coordinator.resume_checkpoint(parent.id, None).unwrap();
    assert_eq!(resumed.subtasks.total, 2);
    assert_eq!(resumed.subtasks.completed, 1);
    assert_eq!(resumed.subtasks.pending, 1);
}

#[test]
fn blocked_merge_resolves_with_ours_and_completes_the_task() {
    let (coordinator, workspace) = coordinator();

    let task = coordinator
        .create_task(scoped_task(
            "merge me",
            "stream-a",
            StreamPhase::Parallel,
            &["src/shared/config.ts"],
            &[],
        ))
        .unwrap()
        .task;

    workspace.set_markers(task.id, "src/shared/config.ts", true);
    coordinator
        .report_merge(
            task.id,
            vec![WorktreeConflict::content("src/shared/config.ts")],
        )
        .unwrap();

    let blocked = coordinator.get_task(task.id).unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked
        .blocked_reason
        .as_deref()
        .is_some_and(|r| r.contains("src/shared/config.ts")));
    let (stream, _) = coordinator.get_stream("stream-a").unwrap();
    assert_eq!(stream.blocked, 1);

    coordinator
        .resolve_worktree(task.id, ResolveStrategy::Ours)
        .unwrap();

    let resolved = coordinator.get_task(task.id).unwrap();
    assert_eq!(resolved.status, TaskStatus::Completed);
    assert!(resolved.conflicts.is_empty());
    assert!(resolved.blocked_reason.is_none());
    let (stream, _) = coordinator.get_stream("stream-a").unwrap();
    assert_eq!(stream.blocked, 0);
    assert_eq!(stream.progress_pct, 100);
}

#[test]
fn manual_resolve_fails_closed_while_markers_remain() {
    let (coordinator, workspace) = coordinator();

    let task = coordinator
        .create_task(NewTask {
            title: "hand merge".to_string(),
            ..NewTask::default()
        })
        .unwrap()
        .task;

    workspace.set_markers(task.id, "notes.md", true);
    coordinator
        .report_merge(
            task.id,
            vec![WorktreeConflict::new(
                "notes.md",
                ConflictKind::Content,
                ResolveStrategy::Manual,
            )],
        )
        .unwrap();

    // First attempt: markers untouched, resolve must refuse.
    let err = coordinator
        .resolve_worktree(task.id, ResolveStrategy::Manual)
        .unwrap_err();
    assert_eq!(err.code, "markers_present");
    assert_eq!(
        coordinator.get_task(task.id).unwrap().status,
        TaskStatus::Blocked
    );

    // The human edits the file; the same command now succeeds.
    workspace.set_markers(task.id, "notes.md", false);
    coordinator
        .resolve_worktree(task.id, ResolveStrategy::Manual)
        .unwrap();
    assert_eq!(
        coordinator.get_task(task.id).unwrap().status,
        TaskStatus::Completed
    );
}

#[test]
fn event_window_reflects_the_full_write_sequence() {
    let (coordinator, _) = coordinator();

    let task = coordinator
        .create_task(scoped_task("t", "stream-a", StreamPhase::Parallel, &[], &[]))
        .unwrap()
        .task;
    complete(&coordinator, task.id);

    let kinds: Vec<&str> = coordinator
        .bus()
        .recent(10)
        .iter()
        .map(|e| e.kind.as_str())
        .collect();
    // Newest first: the completion recomputes the stream after the task event.
    assert_eq!(
        kinds,
        vec![
            "stream.completed",
            "task.completed",
            "stream.progress",
            "task.created",
        ]
    );
}

#[test]
fn durable_coordinator_recovers_tasks_and_checkpoints() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = CoordinatorConfig::with_dir(tmp.path().join("data"));

    let task_id = {
        let coordinator = Coordinator::open_with_config(config.clone()).expect("open");
        let task = coordinator
            .create_task(scoped_task(
                "durable",
                "stream-a",
                StreamPhase::Foundation,
                &[],
                &[],
            ))
            .unwrap()
            .task;
        coordinator
            .create_checkpoint(
                task.id,
                CheckpointTrigger::Manual,
                CreateCheckpoint {
                    phase: Some(PAUSED_PHASE.to_string()),
                    ..CreateCheckpoint::default()
                },
            )
            .unwrap();
        task.id
    };

    let coordinator = Coordinator::open_with_config(config).expect("reopen");
    assert_eq!(coordinator.get_task(task_id).unwrap().title, "durable");
    let resumed = coordinator.resume_checkpoint(task_id, None).unwrap();
    assert!(resumed.checkpoint.is_pause_point());
    let (stream, _) = coordinator.get_stream("stream-a").unwrap();
    assert_eq!(stream.total, 1);
}
