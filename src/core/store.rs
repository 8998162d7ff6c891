//! Task store: the single source of truth for task records.
//!
//! Every accepted write persists the task, emits exactly one domain event,
//! and, for stream-scoped tasks, recomputes the owning stream
//! synchronously before returning, so a caller reading right after a write
//! observes a consistent stream snapshot.
//!
//! Mutations are serialized per task id; reads are lock-free snapshots.

use crate::core::bus::EventBus;
use crate::core::error::{Result, WeaverError};
use crate::core::events::{task_topic, Event, EventKind};
use crate::core::stream::{StreamRegistry, ValidationWarning};
use crate::core::task::{Task, TaskMeta, TaskStatus};
use crate::core::worktree::WorktreeConflict;
use crate::storage::KvStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Soft ceiling on subtasks per parent. Exceeding it warns, never rejects.
pub const MAX_SUBTASKS: usize = 12;

/// Parameters for creating a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub meta: TaskMeta,
}

/// Partial update applied to a task. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub meta: Option<TaskMeta>,
    /// Replaces the recorded merge conflicts (worktree coordinator only).
    #[serde(skip)]
    pub conflicts: Option<Vec<WorktreeConflict>>,
}

/// Filters for listing tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub parent: Option<Uuid>,
}

/// Result of an accepted write: the task plus any non-fatal warnings.
#[derive(Debug, Clone, Serialize)]
pub struct StoreWrite {
    pub task: Task,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ValidationWarning>,
}

/// The task store.
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    bus: Arc<EventBus>,
    streams: Arc<StreamRegistry>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    write_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TaskStore {
    /// Opens the store, loading all persisted tasks.
    pub fn open(
        kv: Arc<dyn KvStore>,
        bus: Arc<EventBus>,
        streams: Arc<StreamRegistry>,
    ) -> Result<Self> {
        let mut tasks = HashMap::new();
        for key in kv.keys("task/")? {
            let Some(bytes) = kv.get(&key)? else {
                continue;
            };
            let task: Task = serde_json::from_slice(&bytes).map_err(|e| {
                WeaverError::storage("task_decode_failed", e.to_string(), "store:open")
                    .with_context("key", key.clone())
            })?;
            tasks.insert(task.id, task);
        }

        Ok(Self {
            kv,
            bus,
            streams,
            tasks: RwLock::new(tasks),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn write_lock(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().expect("lock map poisoned");
        Arc::clone(locks.entry(task_id).or_default())
    }

    fn persist(&self, task: &Task) -> Result<()> {
        let bytes = serde_json::to_vec(task).map_err(|e| {
            WeaverError::storage("task_encode_failed", e.to_string(), "store:persist")
        })?;
        self.kv.put(&format!("task/{}", task.id), &bytes)?;
        Ok(())
    }

    /// Creates a new task in `Pending`.
    pub fn create(&self, new: NewTask) -> Result<StoreWrite> {
        if new.title.trim().is_empty() {
            return Err(WeaverError::validation(
                "empty_title",
                "Task title must not be empty",
                "store:create",
            ));
        }

        let snapshot = self.snapshot();
        let mut warnings = StreamRegistry::validate(&snapshot, &new.meta)?;

        if let Some(parent_id) = new.parent_id {
            if !snapshot.iter().any(|t| t.id == parent_id) {
                return Err(WeaverError::not_found(
                    "unknown_parent",
                    format!("Parent task {parent_id} does not exist"),
                    "store:create",
                ));
            }
            let siblings = snapshot
                .iter()
                .filter(|t| t.parent_id == Some(parent_id))
                .count();
            if siblings + 1 > MAX_SUBTASKS {
                warnings.push(ValidationWarning {
                    code: "subtask_limit".to_string(),
                    message: format!(
                        "Parent {parent_id} now has {} subtasks (soft limit {MAX_SUBTASKS})",
                        siblings + 1
                    ),
                });
            }
        }

        let mut task = Task::new(new.title).with_meta(new.meta);
        task.parent_id = new.parent_id;
        task.agent = new.agent;

        self.persist(&task)?;
        {
            let mut tasks = self.tasks.write().expect("task map poisoned");
            tasks.insert(task.id, task.clone());
        }

        self.bus.publish(&Event::new(
            task_topic(task.id),
            EventKind::TaskCreated,
            json!({ "task": task }),
        ));
        if let Some(stream_id) = task.meta.stream_id() {
            self.streams.recompute(stream_id, &self.snapshot());
        }

        Ok(StoreWrite { task, warnings })
    }

    /// Applies a validated partial update to a task.
    pub fn update(&self, task_id: Uuid, patch: TaskPatch) -> Result<StoreWrite> {
        let lock = self.write_lock(task_id);
        let _guard = lock.lock().expect("task write lock poisoned");

        let mut task = self.get(task_id)?;
        let old_status = task.status;

        if let Some(new_status) = patch.status {
            if new_status != old_status {
                if old_status.is_terminal() {
                    return Err(WeaverError::validation(
                        "terminal_transition",
                        format!(
                            "Task {task_id} is {old_status} and accepts no further transitions"
                        ),
                        "store:update",
                    )
                    .with_context("status", old_status.to_string()));
                }
                if new_status == TaskStatus::Blocked
                    && patch
                        .blocked_reason
                        .as_deref()
                        .map_or(true, |r| r.trim().is_empty())
                {
                    return Err(WeaverError::validation(
                        "missing_blocked_reason",
                        "Transition to blocked requires a non-empty reason",
                        "store:update",
                    )
                    .with_hint("Pass a blocked_reason describing the obstacle"));
                }
            }
        }

        // A reason without a status change amends an already-blocked task;
        // it never applies to anything else.
        if patch.status.map_or(true, |s| s == old_status) {
            if let Some(reason) = &patch.blocked_reason {
                if old_status != TaskStatus::Blocked {
                    return Err(WeaverError::validation(
                        "reason_without_blocked",
                        format!(
                            "Task {task_id} is {old_status}; a blocked reason only applies \
                             to a blocked task"
                        ),
                        "store:update",
                    ));
                }
                if reason.trim().is_empty() {
                    return Err(WeaverError::validation(
                        "missing_blocked_reason",
                        "A blocked task's reason must not be empty",
                        "store:update",
                    ));
                }
            }
        }

        let mut warnings = Vec::new();
        if let Some(meta) = &patch.meta {
            // Validate against the graph as it would look with this task's
            // metadata replaced.
            let others: Vec<Task> = self
                .snapshot()
                .into_iter()
                .filter(|t| t.id != task_id)
                .collect();
            warnings = StreamRegistry::validate(&others, meta)?;
        }

        let old_stream = task.meta.stream_id().map(ToString::to_string);

        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(agent) = patch.agent {
            task.agent = Some(agent);
        }
        if let Some(meta) = patch.meta {
            task.meta = meta;
        }
        if let Some(conflicts) = patch.conflicts {
            task.conflicts = conflicts;
        }
        if let Some(new_status) = patch.status.filter(|s| *s != old_status) {
            task.status = new_status;
            task.blocked_reason = if new_status == TaskStatus::Blocked {
                patch.blocked_reason.clone()
            } else {
                None
            };
        } else if let Some(reason) = &patch.blocked_reason {
            task.blocked_reason = Some(reason.clone());
        }
        task.updated_at = Utc::now();

        self.persist(&task)?;
        {
            let mut tasks = self.tasks.write().expect("task map poisoned");
            tasks.insert(task.id, task.clone());
        }

        // Exactly one domain event per accepted write: a plain update, or a
        // status change specialized for blocked/completed.
        let kind = match patch.status {
            Some(new_status) if new_status != old_status => match new_status {
                TaskStatus::Blocked => EventKind::TaskBlocked,
                TaskStatus::Completed => EventKind::TaskCompleted,
                _ => EventKind::TaskStatusChanged,
            },
            _ => EventKind::TaskUpdated,
        };
        self.bus.publish(&Event::new(
            task_topic(task.id),
            kind,
            json!({
                "task": task,
                "old_status": old_status,
                "new_status": task.status,
            }),
        ));

        let snapshot = self.snapshot();
        let new_stream = task.meta.stream_id().map(ToString::to_string);
        if let Some(stream_id) = &old_stream {
            if old_stream != new_stream {
                self.streams.recompute(stream_id, &snapshot);
            }
        }
        if let Some(stream_id) = &new_stream {
            self.streams.recompute(stream_id, &snapshot);
        }

        Ok(StoreWrite { task, warnings })
    }

    /// Returns the task, or a not-found error; never a silent empty result.
    pub fn get(&self, task_id: Uuid) -> Result<Task> {
        let tasks = self.tasks.read().expect("task map poisoned");
        tasks.get(&task_id).cloned().ok_or_else(|| {
            WeaverError::not_found(
                "unknown_task",
                format!("No task with id {task_id}"),
                "store:get",
            )
            .with_context("task_id", task_id.to_string())
        })
    }

    /// Lists tasks matching the filter, oldest first.
    #[must_use]
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let tasks = self.tasks.read().expect("task map poisoned");
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| {
                filter
                    .stream
                    .as_deref()
                    .map_or(true, |s| t.meta.stream_id() == Some(s))
                    && filter.status.map_or(true, |s| t.status == s)
                    && filter.agent.as_deref().map_or(true, |a| {
                        t.agent.as_deref() == Some(a)
                    })
                    && filter.parent.map_or(true, |p| t.parent_id == Some(p))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Lock-free snapshot of every task.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Task> {
        let tasks = self.tasks.read().expect("task map poisoned");
        tasks.values().cloned().collect()
    }

    /// Direct children of a task.
    #[must_use]
    pub fn children(&self, parent_id: Uuid) -> Vec<Task> {
        self.list(&TaskFilter {
            parent: Some(parent_id),
            ..TaskFilter::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::StreamPhase;
    use crate::storage::InMemoryKv;

    fn store() -> (TaskStore, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let streams = Arc::new(StreamRegistry::new(Arc::clone(&bus)));
        let store = TaskStore::open(Arc::new(InMemoryKv::new()), Arc::clone(&bus), streams)
            .expect("open store");
        (store, bus)
    }

    fn scoped(stream_id: &str, depends_on: &[&str]) -> TaskMeta {
        TaskMeta::StreamScoped {
            stream_id: stream_id.to_string(),
            phase: StreamPhase::Foundation,
            files: Vec::new(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn create_starts_pending_and_emits() {
        let (store, bus) = store();
        let write = store
            .create(NewTask {
                title: "build".to_string(),
                ..NewTask::default()
            })
            .unwrap();
        assert_eq!(write.task.status, TaskStatus::Pending);
        assert_eq!(bus.recent(1)[0].kind, EventKind::TaskCreated);
    }

    #[test]
    fn empty_title_is_rejected() {
        let (store, _) = store();
        let err = store
            .create(NewTask {
                title: "  ".to_string(),
                ..NewTask::default()
            })
            .unwrap_err();
        assert_eq!(err.code, "empty_title");
    }

    #[test]
    fn blocked_requires_reason() {
        let (store, _) = store();
        let task = store
            .create(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;

        let err = store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    ..TaskPatch::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code, "missing_blocked_reason");

        let write = store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    blocked_reason: Some("waiting on review".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(write.task.status, TaskStatus::Blocked);
        assert_eq!(
            write.task.blocked_reason.as_deref(),
            Some("waiting on review")
        );
    }

    #[test]
    fn same_status_blocked_patch_keeps_the_reason() {
        let (store, _) = store();
        let task = store
            .create(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;
        store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    blocked_reason: Some("merge conflict".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap();

        // Re-asserting the current status must not wipe the reason.
        let write = store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    agent: Some("worker-2".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(write.task.status, TaskStatus::Blocked);
        assert_eq!(write.task.blocked_reason.as_deref(), Some("merge conflict"));
    }

    #[test]
    fn blocked_reason_amends_in_place_only_while_blocked() {
        let (store, _) = store();
        let task = store
            .create(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;

        let err = store
            .update(
                task.id,
                TaskPatch {
                    blocked_reason: Some("not blocked yet".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code, "reason_without_blocked");

        store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    blocked_reason: Some("first reason".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        let write = store
            .update(
                task.id,
                TaskPatch {
                    blocked_reason: Some("sharper reason".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(write.task.blocked_reason.as_deref(), Some("sharper reason"));
    }

    #[test]
    fn terminal_tasks_accept_no_transitions() {
        let (store, _) = store();
        let task = store
            .create(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;
        store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ..TaskPatch::default()
                },
            )
            .unwrap();

        let err = store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..TaskPatch::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code, "terminal_transition");
    }

    #[test]
    fn status_change_events_are_specialized() {
        let (store, bus) = store();
        let task = store
            .create(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;

        store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(bus.recent(1)[0].kind, EventKind::TaskStatusChanged);

        store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(bus.recent(1)[0].kind, EventKind::TaskCompleted);
    }

    #[test]
    fn plain_update_emits_task_updated() {
        let (store, bus) = store();
        let task = store
            .create(NewTask {
                title: "t".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;
        store
            .update(
                task.id,
                TaskPatch {
                    agent: Some("worker-1".to_string()),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert_eq!(bus.recent(1)[0].kind, EventKind::TaskUpdated);
    }

    #[test]
    fn cycle_creating_write_is_rejected_and_graph_unchanged() {
        let (store, _) = store();
        store
            .create(NewTask {
                title: "a".to_string(),
                meta: scoped("a", &["b"]),
                ..NewTask::default()
            })
            .unwrap();

        let err = store
            .create(NewTask {
                title: "b".to_string(),
                meta: scoped("b", &["a"]),
                ..NewTask::default()
            })
            .unwrap_err();
        assert_eq!(err.code, "dependency_cycle");

        // The rejected write left no trace.
        assert_eq!(store.snapshot().len(), 1);
        assert!(store
            .list(&TaskFilter {
                stream: Some("b".to_string()),
                ..TaskFilter::default()
            })
            .is_empty());
    }

    #[test]
    fn subtask_limit_warns_but_accepts() {
        let (store, _) = store();
        let parent = store
            .create(NewTask {
                title: "parent".to_string(),
                ..NewTask::default()
            })
            .unwrap()
            .task;

        let mut last = None;
        for i in 0..=MAX_SUBTASKS {
            last = Some(
                store
                    .create(NewTask {
                        title: format!("sub {i}"),
                        parent_id: Some(parent.id),
                        ..NewTask::default()
                    })
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last.warnings.iter().any(|w| w.code == "subtask_limit"));
        assert_eq!(store.children(parent.id).len(), MAX_SUBTASKS + 1);
    }

    #[test]
    fn unknown_parent_is_not_found() {
        let (store, _) = store();
        let err = store
            .create(NewTask {
                title: "orphan".to_string(),
                parent_id: Some(Uuid::new_v4()),
                ..NewTask::default()
            })
            .unwrap_err();
        assert_eq!(err.code, "unknown_parent");
    }

    #[test]
    fn list_filters_compose() {
        let (store, _) = store();
        let a = store
            .create(NewTask {
                title: "a".to_string(),
                agent: Some("w1".to_string()),
                meta: scoped("s1", &[]),
                ..NewTask::default()
            })
            .unwrap()
            .task;
        store
            .create(NewTask {
                title: "b".to_string(),
                agent: Some("w2".to_string()),
                meta: scoped("s2", &[]),
                ..NewTask::default()
            })
            .unwrap();

        let found = store.list(&TaskFilter {
            stream: Some("s1".to_string()),
            agent: Some("w1".to_string()),
            ..TaskFilter::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        let none = store.list(&TaskFilter {
            stream: Some("s1".to_string()),
            agent: Some("w2".to_string()),
            ..TaskFilter::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn tasks_survive_reopen() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let bus = Arc::new(EventBus::new());
        let streams = Arc::new(StreamRegistry::new(Arc::clone(&bus)));

        let task_id = {
            let store =
                TaskStore::open(Arc::clone(&kv), Arc::clone(&bus), Arc::clone(&streams)).unwrap();
            store
                .create(NewTask {
                    title: "persisted".to_string(),
                    ..NewTask::default()
                })
                .unwrap()
                .task
                .id
        };

        let store = TaskStore::open(kv, bus, streams).unwrap();
        assert_eq!(store.get(task_id).unwrap().title, "persisted");
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (store, _) = store();
        let err = store.get(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code, "unknown_task");
    }
}
