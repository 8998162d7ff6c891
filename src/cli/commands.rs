//! CLI command definitions.
//!
//! All features are accessible via CLI. Transports are projections over the
//! same coordinator the CLI drives.

use super::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PhaseArg {
    Foundation,
    Parallel,
    Integration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusArg {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StrategyArg {
    Ours,
    Theirs,
    Manual,
}

/// Weaver CLI - coordination core for multi-agent work streams.
#[derive(Parser)]
#[command(name = "weaver")]
#[command(
    version,
    about,
    long_about = "Coordinates parallel agent work streams: tasks, derived streams, \
checkpoints, and merge conflict resolution."
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show version information
    Version,

    /// Run the HTTP polling API
    Serve(ServeArgs),

    /// Task management commands
    #[command(subcommand)]
    Task(TaskCommands),

    /// Derived stream inspection commands
    #[command(subcommand)]
    Stream(StreamCommands),

    /// Checkpoint lifecycle commands
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),

    /// Worktree merge status and resolution commands
    #[command(subcommand)]
    Worktree(WorktreeCommands),
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,

    #[arg(long, default_value_t = 200)]
    pub events_limit: usize,
}

/// Task subcommands.
#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task
    Create(TaskCreateArgs),
    /// Update a task (status, metadata, assignment)
    Update(TaskUpdateArgs),
    /// Show a single task
    Show(TaskShowArgs),
    /// List tasks
    List(TaskListArgs),
}

#[derive(Args)]
pub struct TaskCreateArgs {
    /// Task title
    pub title: String,

    /// Parent task id (makes this a subtask)
    #[arg(long)]
    pub parent: Option<Uuid>,

    /// Agent assigned to the task
    #[arg(long)]
    pub agent: Option<String>,

    /// Stream this task belongs to
    #[arg(long)]
    pub stream: Option<String>,

    /// Phase within the stream (requires --stream)
    #[arg(long, requires = "stream")]
    pub phase: Option<PhaseArg>,

    /// Files the task intends to touch (requires --stream)
    #[arg(long = "file", requires = "stream")]
    pub files: Vec<String>,

    /// Streams this task's stream depends on (requires --stream)
    #[arg(long = "depends-on", requires = "stream")]
    pub depends_on: Vec<String>,
}

#[derive(Args)]
pub struct TaskUpdateArgs {
    /// Task id
    pub id: Uuid,

    /// New title
    #[arg(long)]
    pub title: Option<String>,

    /// New status
    #[arg(long)]
    pub status: Option<StatusArg>,

    /// Reason, required when blocking
    #[arg(long)]
    pub reason: Option<String>,

    /// Agent assigned to the task
    #[arg(long)]
    pub agent: Option<String>,
}

#[derive(Args)]
pub struct TaskShowArgs {
    /// Task id
    pub id: Uuid,
}

#[derive(Args)]
pub struct TaskListArgs {
    /// Filter by stream
    #[arg(long)]
    pub stream: Option<String>,

    /// Filter by status
    #[arg(long)]
    pub status: Option<StatusArg>,

    /// Filter by agent
    #[arg(long)]
    pub agent: Option<String>,

    /// Filter by parent task
    #[arg(long)]
    pub parent: Option<Uuid>,
}

/// Stream subcommands.
#[derive(Subcommand)]
pub enum StreamCommands {
    /// List all streams with progress and readiness
    List,
    /// Show one stream and its tasks
    Show(StreamShowArgs),
    /// Check candidate files against other streams' claims
    Conflicts(StreamConflictsArgs),
}

#[derive(Args)]
pub struct StreamShowArgs {
    /// Stream id
    pub id: String,
}

#[derive(Args)]
pub struct StreamConflictsArgs {
    /// Candidate files to check
    #[arg(required = true)]
    pub files: Vec<String>,

    /// Stream to exclude from the check (the claimant itself)
    #[arg(long)]
    pub exclude: Option<String>,
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// Create a manual checkpoint for a task
    Create(CheckpointCreateArgs),
    /// Resume a task from its best (or a specific) checkpoint
    Resume(CheckpointResumeArgs),
    /// List recent checkpoints for a task
    List(CheckpointListArgs),
    /// Delete old checkpoints
    Cleanup(CheckpointCleanupArgs),
}

#[derive(Args)]
pub struct CheckpointCreateArgs {
    /// Task id
    pub task: Uuid,

    /// Execution phase marker; `paused` marks a deliberate pause point
    #[arg(long)]
    pub phase: Option<String>,

    /// Step-within-phase marker
    #[arg(long)]
    pub step: Option<String>,

    /// Context entries to preserve, as key=value pairs
    #[arg(long = "context")]
    pub context: Vec<String>,

    /// Draft content to preserve
    #[arg(long)]
    pub draft: Option<String>,

    /// Draft payload type tag
    #[arg(long, requires = "draft")]
    pub draft_kind: Option<String>,

    /// Expiry override in minutes
    #[arg(long)]
    pub expires_in: Option<i64>,
}

#[derive(Args)]
pub struct CheckpointResumeArgs {
    /// Task id
    pub task: Uuid,

    /// Specific checkpoint to resume from
    #[arg(long)]
    pub checkpoint: Option<Uuid>,
}

#[derive(Args)]
pub struct CheckpointListArgs {
    /// Task id
    pub task: Uuid,

    /// Maximum entries to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args)]
pub struct CheckpointCleanupArgs {
    /// Restrict to one task
    #[arg(long)]
    pub task: Option<Uuid>,

    /// Only delete checkpoints older than this many minutes
    #[arg(long)]
    pub older_than: Option<i64>,

    /// Always keep this many newest checkpoints per task
    #[arg(long, default_value_t = 1)]
    pub keep_latest: usize,
}

/// Worktree subcommands.
#[derive(Subcommand)]
pub enum WorktreeCommands {
    /// Show merge conflict status for a task
    Status(WorktreeStatusArgs),
    /// Resolve a blocked merge
    Resolve(WorktreeResolveArgs),
}

#[derive(Args)]
pub struct WorktreeStatusArgs {
    /// Task id
    pub task: Uuid,
}

#[derive(Args)]
pub struct WorktreeResolveArgs {
    /// Task id
    pub task: Uuid,

    /// Resolution strategy
    #[arg(long)]
    pub strategy: StrategyArg,
}
