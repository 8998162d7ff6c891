//! Checkpoint manager: append-only recovery points for in-flight tasks.
//!
//! Checkpoints snapshot a task's execution state (phase/step/context) and
//! optionally an in-progress draft payload, so any task can be resumed
//! after a crash or a deliberate pause. History is bounded per task and
//! time-expired; expiry is enforced at read time, not only by the
//! maintenance sweep.

use crate::core::bus::EventBus;
use crate::core::error::{Result, WeaverError};
use crate::core::events::{task_topic, Event, EventKind};
use crate::core::task::{Task, TaskStatus};
use crate::storage::KvStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum checkpoints retained per task; oldest pruned on insert.
pub const CHECKPOINT_CAP: usize = 5;

/// Draft payloads beyond this many bytes are truncated, never rejected.
pub const DRAFT_CEILING: usize = 64 * 1024;

/// Marker appended to a truncated draft.
pub const TRUNCATION_MARKER: &str = "\n[draft truncated]";

/// Default expiry for automatic checkpoints (crash recovery window).
pub const AUTO_EXPIRY_MINUTES: i64 = 24 * 60;

/// Default expiry for manual checkpoints (deliberate pause/resume).
pub const MANUAL_EXPIRY_MINUTES: i64 = 7 * 24 * 60;

/// Phase marker that makes a manual checkpoint a deliberate pause point.
pub const PAUSED_PHASE: &str = "paused";

const DRAFT_PREVIEW_BYTES: usize = 400;

/// What caused a checkpoint to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Automatic, on a task status change.
    AutoStatusChange,
    /// Automatic, on a subtask change.
    AutoSubtaskChange,
    /// Explicitly requested by the worker or a human.
    Manual,
    /// Written while handling an error.
    Error,
}

impl CheckpointTrigger {
    /// Default expiry window for this trigger, in minutes.
    #[must_use]
    pub fn default_expiry_minutes(self) -> i64 {
        match self {
            Self::Manual => MANUAL_EXPIRY_MINUTES,
            Self::AutoStatusChange | Self::AutoSubtaskChange | Self::Error => AUTO_EXPIRY_MINUTES,
        }
    }
}

/// An in-progress draft payload preserved inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    /// Draft content, capped at [`DRAFT_CEILING`].
    pub content: String,
    /// Payload type tag (free-form, e.g. `markdown`).
    pub kind: Option<String>,
    /// Whether the content was truncated at write time.
    pub truncated: bool,
}

/// An immutable recovery point for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// Monotonically increasing per-task sequence number.
    pub sequence: u64,
    /// What triggered the write.
    pub trigger: CheckpointTrigger,
    /// Execution phase marker.
    pub phase: Option<String>,
    /// Step-within-phase marker.
    pub step: Option<String>,
    /// Arbitrary preserved execution context.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Optional draft payload.
    pub draft: Option<Draft>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; past this the checkpoint is never offered for resume.
    pub expires_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Whether this checkpoint is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether this is a deliberate pause point, preferred by resume.
    #[must_use]
    pub fn is_pause_point(&self) -> bool {
        self.trigger == CheckpointTrigger::Manual && self.phase.as_deref() == Some(PAUSED_PHASE)
    }
}

/// Parameters for creating a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CreateCheckpoint {
    pub phase: Option<String>,
    pub step: Option<String>,
    pub context: HashMap<String, Value>,
    /// Draft content and optional payload-type tag.
    pub draft: Option<(String, Option<String>)>,
    /// Expiry override in minutes; trigger default when absent.
    pub expiry_minutes: Option<i64>,
}

/// Counts of a task's subtasks by status, returned on resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskRollup {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub cancelled: usize,
}

impl SubtaskRollup {
    /// Tallies the given subtasks.
    #[must_use]
    pub fn from_tasks(subtasks: &[Task]) -> Self {
        let mut rollup = Self {
            total: subtasks.len(),
            ..Self::default()
        };
        for task in subtasks {
            match task.status {
                TaskStatus::Pending => rollup.pending += 1,
                TaskStatus::InProgress => rollup.in_progress += 1,
                TaskStatus::Blocked => rollup.blocked += 1,
                TaskStatus::Completed => rollup.completed += 1,
                TaskStatus::Cancelled => rollup.cancelled += 1,
            }
        }
        rollup
    }
}

/// Everything a caller needs to continue a task without re-deriving state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub checkpoint: Checkpoint,
    /// True when an explicitly requested checkpoint was expired or unknown
    /// and the latest valid one was returned instead.
    pub fallback: bool,
    /// Leading slice of the draft content, if any.
    pub draft_preview: Option<String>,
    pub subtasks: SubtaskRollup,
}

/// Filter for [`CheckpointManager::cleanup`].
#[derive(Debug, Clone, Default)]
pub struct CleanupFilter {
    /// Restrict to one task; all tasks when absent.
    pub task_id: Option<Uuid>,
    /// Only delete checkpoints older than this many minutes.
    pub older_than_minutes: Option<i64>,
    /// Always preserve at least this many newest checkpoints per task.
    pub keep_latest: usize,
}

/// Manages checkpoint creation, resume, and retention.
pub struct CheckpointManager {
    kv: Arc<dyn KvStore>,
    bus: Arc<EventBus>,
}

impl CheckpointManager {
    /// Creates a manager persisting through `kv` and publishing to `bus`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, bus: Arc<EventBus>) -> Self {
        Self { kv, bus }
    }

    fn key(task_id: Uuid) -> String {
        format!("checkpoint/{task_id}")
    }

    fn load(&self, task_id: Uuid) -> Result<Vec<Checkpoint>> {
        let Some(bytes) = self.kv.get(&Self::key(task_id))? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            WeaverError::storage(
                "checkpoint_decode_failed",
                e.to_string(),
                "checkpoint:load",
            )
            .with_context("task_id", task_id.to_string())
        })
    }

    fn save(&self, task_id: Uuid, checkpoints: &[Checkpoint]) -> Result<()> {
        if checkpoints.is_empty() {
            self.kv.delete(&Self::key(task_id))?;
            return Ok(());
        }
        let bytes = serde_json::to_vec(checkpoints).map_err(|e| {
            WeaverError::storage(
                "checkpoint_encode_failed",
                e.to_string(),
                "checkpoint:save",
            )
        })?;
        self.kv.put(&Self::key(task_id), &bytes)?;
        Ok(())
    }

    /// Creates a checkpoint with the next sequence number for the task,
    /// then prunes the oldest entries beyond [`CHECKPOINT_CAP`].
    pub fn create(
        &self,
        task_id: Uuid,
        trigger: CheckpointTrigger,
        params: CreateCheckpoint,
    ) -> Result<Checkpoint> {
        let mut checkpoints = self.load(task_id)?;
        let sequence = checkpoints.iter().map(|c| c.sequence).max().unwrap_or(0) + 1;

        let draft = params.draft.map(|(content, kind)| {
            let (content, truncated) = truncate_draft(content);
            Draft {
                content,
                kind,
                truncated,
            }
        });

        let now = Utc::now();
        let expiry_minutes = params
            .expiry_minutes
            .unwrap_or_else(|| trigger.default_expiry_minutes());
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            task_id,
            sequence,
            trigger,
            phase: params.phase,
            step: params.step,
            context: params.context,
            draft,
            created_at: now,
            expires_at: now + Duration::minutes(expiry_minutes),
        };

        checkpoints.push(checkpoint.clone());
        checkpoints.sort_by_key(|c| c.sequence);
        while checkpoints.len() > CHECKPOINT_CAP {
            checkpoints.remove(0);
        }
        self.save(task_id, &checkpoints)?;

        self.bus.publish(&Event::new(
            task_topic(task_id),
            EventKind::CheckpointCreated,
            json!({
                "task_id": task_id,
                "checkpoint_id": checkpoint.id,
                "sequence": checkpoint.sequence,
                "trigger": checkpoint.trigger,
            }),
        ));

        Ok(checkpoint)
    }

    /// Lists up to `limit` checkpoints for a task, newest first.
    pub fn list(&self, task_id: Uuid, limit: usize) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.load(task_id)?;
        checkpoints.sort_by_key(|c| std::cmp::Reverse(c.sequence));
        checkpoints.truncate(limit);
        Ok(checkpoints)
    }

    /// Resumes a task from a checkpoint.
    ///
    /// With an explicit id, that checkpoint is returned if it exists and is
    /// not expired; otherwise resume transparently falls back to the latest
    /// valid one. Without an id, a valid manual pause point is preferred
    /// over newer automatic checkpoints; otherwise the latest valid
    /// checkpoint wins. Expired checkpoints are never offered, even if they
    /// are all a task has.
    pub fn resume(
        &self,
        task_id: Uuid,
        checkpoint_id: Option<Uuid>,
        subtasks: &[Task],
    ) -> Result<ResumeState> {
        let now = Utc::now();
        let checkpoints = self.load(task_id)?;
        let valid: Vec<&Checkpoint> = checkpoints
            .iter()
            .filter(|c| !c.is_expired_at(now))
            .collect();

        let mut fallback = false;
        let chosen = match checkpoint_id {
            Some(id) => match valid.iter().find(|c| c.id == id) {
                Some(c) => Some(*c),
                None => {
                    fallback = true;
                    select_default(&valid)
                }
            },
            None => select_default(&valid),
        };

        let Some(checkpoint) = chosen else {
            return Err(WeaverError::not_found(
                "no_valid_checkpoint",
                format!("Task {task_id} has no unexpired checkpoint to resume from"),
                "checkpoint:resume",
            )
            .with_context("task_id", task_id.to_string()));
        };

        let draft_preview = checkpoint
            .draft
            .as_ref()
            .map(|d| truncate_at_boundary(&d.content, DRAFT_PREVIEW_BYTES).to_string());

        Ok(ResumeState {
            checkpoint: checkpoint.clone(),
            fallback,
            draft_preview,
            subtasks: SubtaskRollup::from_tasks(subtasks),
        })
    }

    /// Deletes checkpoints matching the filter, always preserving at least
    /// `keep_latest` newest per task. Returns the number deleted.
    pub fn cleanup(&self, filter: &CleanupFilter) -> Result<usize> {
        let task_ids: Vec<Uuid> = match filter.task_id {
            Some(id) => vec![id],
            None => self
                .kv
                .keys("checkpoint/")?
                .iter()
                .filter_map(|k| k.strip_prefix("checkpoint/"))
                .filter_map(|raw| Uuid::parse_str(raw).ok())
                .collect(),
        };

        let cutoff = filter
            .older_than_minutes
            .map(|m| Utc::now() - Duration::minutes(m));

        let mut deleted = 0;
        for task_id in task_ids {
            let mut checkpoints = self.load(task_id)?;
            checkpoints.sort_by_key(|c| std::cmp::Reverse(c.sequence));

            let before = checkpoints.len();
            let mut kept = Vec::new();
            for (idx, checkpoint) in checkpoints.into_iter().enumerate() {
                let protected = idx < filter.keep_latest;
                let matches_age = cutoff.map_or(true, |cut| checkpoint.created_at < cut);
                if protected || !matches_age {
                    kept.push(checkpoint);
                }
            }
            deleted += before - kept.len();
            kept.sort_by_key(|c| c.sequence);
            self.save(task_id, &kept)?;
        }
        Ok(deleted)
    }

    /// Maintenance pass: purges every checkpoint past its expiry.
    ///
    /// Safe to run concurrently with normal traffic; it only removes
    /// entries already outside their validity window.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for key in self.kv.keys("checkpoint/")? {
            let Some(task_id) = key
                .strip_prefix("checkpoint/")
                .and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                continue;
            };
            let mut checkpoints = self.load(task_id)?;
            let before = checkpoints.len();
            checkpoints.retain(|c| !c.is_expired_at(now));
            if checkpoints.len() != before {
                purged += before - checkpoints.len();
                self.save(task_id, &checkpoints)?;
            }
        }
        Ok(purged)
    }
}

/// Resume preference: a manual pause point beats recency; otherwise the
/// highest sequence wins.
fn select_default<'a>(valid: &[&'a Checkpoint]) -> Option<&'a Checkpoint> {
    valid
        .iter()
        .filter(|c| c.is_pause_point())
        .max_by_key(|c| c.sequence)
        .or_else(|| valid.iter().max_by_key(|c| c.sequence))
        .copied()
}

fn truncate_draft(content: String) -> (String, bool) {
    if content.len() <= DRAFT_CEILING {
        return (content, false);
    }
    let mut truncated = truncate_at_boundary(&content, DRAFT_CEILING).to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
fn truncate_at_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
