//! Stream registry: derived, dependency-ordered groupings of tasks.
//!
//! Streams are never persisted. Every stream object is recomputed from the
//! current task set, so stream state can never drift from task data. The
//! registry keeps a read-through cache keyed by stream id, invalidated
//! (together with dependents) on any write touching that stream's tasks.

use crate::core::bus::EventBus;
use crate::core::error::{Result, WeaverError};
use crate::core::events::{stream_topic, Event, EventKind};
use crate::core::task::{StreamPhase, Task, TaskMeta, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Computed state of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Stream id, doubling as its name.
    pub id: String,
    /// Phase, from member task metadata (majority wins).
    pub phase: StreamPhase,
    /// Member task counts.
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub pending: usize,
    /// Completed percentage, 0..=100.
    pub progress_pct: u8,
    /// Union of member tasks' declared files.
    pub files: BTreeSet<String>,
    /// Union of member tasks' declared stream dependencies.
    pub depends_on: BTreeSet<String>,
    /// Whether every dependency stream is fully completed and unblocked.
    ///
    /// Exposed so external schedulers can decide when to start workers;
    /// the core itself never starts them.
    pub ready: bool,
}

/// Non-fatal validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub code: String,
    pub message: String,
}

impl ValidationWarning {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Registry deriving stream state from tasks.
pub struct StreamRegistry {
    bus: Arc<EventBus>,
    cache: RwLock<HashMap<String, Stream>>,
}

impl StreamRegistry {
    /// Creates a registry publishing derived events to `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Derives all streams from the given task set. Pure function.
    #[must_use]
    pub fn derive(tasks: &[Task]) -> HashMap<String, Stream> {
        let mut grouped: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        for task in tasks {
            if let Some(stream_id) = task.meta.stream_id() {
                grouped.entry(stream_id).or_default().push(task);
            }
        }

        let mut streams: HashMap<String, Stream> = grouped
            .iter()
            .map(|(id, members)| ((*id).to_string(), Self::derive_one(id, members)))
            .collect();

        // Readiness needs the other streams' counts, so resolve it after
        // all streams are derived. A dependency on an unobserved stream
        // means not ready.
        let stats: HashMap<String, (bool, usize)> = streams
            .iter()
            .map(|(id, s)| (id.clone(), (s.progress_pct == 100, s.blocked)))
            .collect();
        for stream in streams.values_mut() {
            stream.ready = stream.depends_on.iter().all(|dep| {
                stats
                    .get(dep)
                    .is_some_and(|(complete, blocked)| *complete && *blocked == 0)
            });
        }

        streams
    }

    fn derive_one(id: &str, members: &[&Task]) -> Stream {
        let mut completed = 0;
        let mut in_progress = 0;
        let mut blocked = 0;
        let mut pending = 0;
        let mut cancelled = 0;
        let mut files = BTreeSet::new();
        let mut depends_on = BTreeSet::new();
        let mut phase_votes: BTreeMap<StreamPhase, usize> = BTreeMap::new();

        for task in members {
            match task.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::InProgress => in_progress += 1,
                TaskStatus::Blocked => blocked += 1,
                TaskStatus::Pending => pending += 1,
                TaskStatus::Cancelled => cancelled += 1,
            }
            if let TaskMeta::StreamScoped {
                phase,
                files: f,
                depends_on: d,
                ..
            } = &task.meta
            {
                *phase_votes.entry(*phase).or_insert(0) += 1;
                files.extend(f.iter().cloned());
                depends_on.extend(d.iter().cloned());
            }
        }

        let total = members.len();
        let phase = phase_votes
            .into_iter()
            .max_by_key(|(_, votes)| *votes)
            .map_or(StreamPhase::Foundation, |(phase, _)| phase);
        // Cancelled tasks are terminal dead ends; they leave the
        // denominator so a stream with one can still reach 100% and
        // unblock its dependents.
        let live = total - cancelled;
        let progress_pct = if total == 0 {
            0
        } else if live == 0 {
            100
        } else {
            u8::try_from(completed * 100 / live).unwrap_or(100)
        };

        Stream {
            id: id.to_string(),
            phase,
            total,
            completed,
            in_progress,
            blocked,
            pending,
            progress_pct,
            files,
            depends_on,
            ready: false,
        }
    }

    /// Validates the stream graph that would result from applying
    /// `candidate` metadata on top of the existing task set.
    ///
    /// A cycle is rejected (the error names the cycle members and the graph
    /// remains unchanged; validation runs before any write). Phase
    /// inconsistencies are returned as non-fatal warnings.
    pub fn validate(tasks: &[Task], candidate: &TaskMeta) -> Result<Vec<ValidationWarning>> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut phases: BTreeMap<String, StreamPhase> = BTreeMap::new();

        let mut observe = |meta: &TaskMeta| {
            if let TaskMeta::StreamScoped {
                stream_id,
                phase,
                depends_on,
                ..
            } = meta
            {
                let entry = edges.entry(stream_id.clone()).or_default();
                entry.extend(depends_on.iter().cloned());
                phases.entry(stream_id.clone()).or_insert(*phase);
                for dep in depends_on {
                    edges.entry(dep.clone()).or_default();
                }
            }
        };
        for task in tasks {
            observe(&task.meta);
        }
        observe(candidate);

        if let Some(cycle) = find_cycle(&edges) {
            return Err(WeaverError::validation(
                "dependency_cycle",
                format!("Stream dependencies form a cycle: {}", cycle.join(" -> ")),
                "stream:validate",
            )
            .with_context("cycle", cycle.join(","))
            .with_hint("Remove one of the depends_on edges in the cycle"));
        }

        let mut warnings = Vec::new();
        if let TaskMeta::StreamScoped {
            stream_id,
            phase,
            depends_on,
            ..
        } = candidate
        {
            match phase {
                StreamPhase::Parallel if depends_on.is_empty() => {
                    warnings.push(ValidationWarning::new(
                        "parallel_without_dependencies",
                        format!(
                            "Parallel stream '{stream_id}' declares no dependencies; \
                             expected at least one foundation stream"
                        ),
                    ));
                }
                StreamPhase::Integration => {
                    for dep in depends_on {
                        if phases.get(dep) != Some(&StreamPhase::Parallel) {
                            warnings.push(ValidationWarning::new(
                                "integration_dependency_not_parallel",
                                format!(
                                    "Integration stream '{stream_id}' depends on '{dep}', \
                                     which is not an observed parallel stream"
                                ),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(warnings)
    }

    /// Drops the cached entry for `stream_id` and for every stream that
    /// depends on it (their readiness may have changed).
    pub fn invalidate(&self, stream_id: &str) {
        let mut cache = self.cache.write().expect("stream cache poisoned");
        cache.remove(stream_id);
        let dependents: Vec<String> = cache
            .iter()
            .filter(|(_, s)| s.depends_on.contains(stream_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in dependents {
            cache.remove(&id);
        }
    }

    /// Recomputes the stream after a write touching it and emits the derived
    /// event: `stream.completed` at 100%, `stream.blocked` when any member
    /// is blocked, else `stream.progress`.
    pub fn recompute(&self, stream_id: &str, tasks: &[Task]) -> Option<Stream> {
        self.invalidate(stream_id);
        let stream = self.get(stream_id, tasks)?;

        let kind = if stream.blocked > 0 {
            EventKind::StreamBlocked
        } else if stream.progress_pct == 100 {
            EventKind::StreamCompleted
        } else {
            EventKind::StreamProgress
        };
        let payload = json!({
            "stream_id": stream.id,
            "phase": stream.phase,
            "progress_pct": stream.progress_pct,
            "completed": stream.completed,
            "total": stream.total,
            "blocked": stream.blocked,
            "ready": stream.ready,
        });
        self.bus
            .publish(&Event::new(stream_topic(stream_id), kind, payload));

        Some(stream)
    }

    /// Read-through lookup for one stream.
    #[must_use]
    pub fn get(&self, stream_id: &str, tasks: &[Task]) -> Option<Stream> {
        {
            let cache = self.cache.read().expect("stream cache poisoned");
            if let Some(stream) = cache.get(stream_id) {
                return Some(stream.clone());
            }
        }

        let derived = Self::derive(tasks);
        let mut cache = self.cache.write().expect("stream cache poisoned");
        for (id, stream) in &derived {
            cache.entry(id.clone()).or_insert_with(|| stream.clone());
        }
        derived.get(stream_id).cloned()
    }

    /// Snapshot of all streams, sorted by id.
    #[must_use]
    pub fn snapshot(&self, tasks: &[Task]) -> Vec<Stream> {
        let derived = Self::derive(tasks);
        {
            let mut cache = self.cache.write().expect("stream cache poisoned");
            *cache = derived.clone();
        }
        let mut streams: Vec<Stream> = derived.into_values().collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        streams
    }
}

/// Finds a cycle in the `stream -> depends_on` adjacency map, if any.
///
/// Iterative Kahn's algorithm: peel nodes with no unresolved dependencies;
/// whatever remains participates in (or depends into) a cycle. The returned
/// list walks one actual cycle so the caller can report it cleanly.
fn find_cycle(edges: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = edges
        .iter()
        .map(|(k, deps)| (k.as_str(), deps.iter().map(String::as_str).collect()))
        .collect();

    let mut queue: VecDeque<&str> = remaining
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(id, _)| *id)
        .collect();

    while let Some(resolved) = queue.pop_front() {
        remaining.remove(resolved);
        for (id, deps) in &mut remaining {
            if deps.remove(resolved) && deps.is_empty() {
                queue.push_back(id);
            }
        }
    }

    if remaining.is_empty() {
        return None;
    }

    // Walk dependency links among the remaining nodes until one repeats,
    // then slice out the repeated segment.
    let start = *remaining.keys().next()?;
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = remaining
            .get(current)?
            .iter()
            .find(|dep| remaining.contains_key(**dep))
            .copied()?;
        if let Some(pos) = path.iter().position(|n| *n == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return Some(cycle);
        }
        path.push(next);
        current = next;
    }
}
