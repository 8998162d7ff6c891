//! Core domain: tasks, streams, checkpoints, worktrees, and the event bus.
//!
//! The coordination model is a single writing process owning a task store.
//! Streams are never stored; they are derived on demand from stream-scoped
//! task metadata, so stream state can always be rebuilt from tasks alone.
//!
//! # Architecture
//!
//! ```text
//! Tasks (stored) → Streams (derived) → Events (published)
//! ```
//!
//! Every accepted write emits exactly one domain event and, for
//! stream-scoped tasks, recomputes the owning stream before the write
//! returns. Readers therefore never observe a task change without its
//! stream consequence.
//!
//! # Modules
//!
//! - [`task`] - Task records, statuses, and stream-scoped metadata
//! - [`store`] - The persistent task store and its write validation
//! - [`stream`] - Derived stream registry: progress, phases, readiness
//! - [`conflict`] - File-level conflict detection across streams
//! - [`checkpoint`] - Bounded, expiring recovery points per task
//! - [`worktree`] - Merge conflict reporting and resolution
//! - [`bus`] - Topic-based publish/subscribe with polling fallback
//! - [`coordinator`] - Facade wiring the components together
//! - [`error`] - Structured error types
//! - [`events`] - Domain event definitions and topics

pub mod bus;
pub mod checkpoint;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod store;
pub mod stream;
pub mod task;
pub mod worktree;
