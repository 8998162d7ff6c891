//! CLI commands and argument parsing.
//!
//! The command-line interface for Weaver, built on
//! [`clap`](https://docs.rs/clap). Every coordinator operation is reachable
//! from here; the HTTP API is a projection over the same core.
//!
//! # Commands
//!
//! - **Task management**: `task create`, `task update`, `task show`, `task list`
//! - **Stream inspection**: `stream list`, `stream show`, `stream conflicts`
//! - **Checkpoints**: `checkpoint create`, `checkpoint resume`, `checkpoint list`,
//!   `checkpoint cleanup`
//! - **Worktrees**: `worktree status`, `worktree resolve`
//! - **Server mode**: `serve` for the HTTP polling API
//! - **Version info**: `version`
//!
//! # Output Formats
//!
//! Commands support multiple output formats via the `-f`/`--format` flag:
//!
//! - `table` - Human-readable format (default)
//! - `json` - Machine-readable JSON
//! - `yaml` - YAML
//!
//! # Example
//!
//! ```bash,no_run
//! # Create a stream-scoped task
//! weaver task create "JWT validation" --stream auth --phase foundation --file src/auth/jwt.ts
//!
//! # Watch stream progress in JSON
//! weaver stream list -f json
//!
//! # Start the HTTP polling API
//! weaver serve --port 8787
//! ```
//!
//! # Modules
//!
//! - [`commands`] - Command definitions
//! - [`output`] - Output formatting and table rendering

pub mod commands;
pub mod output;
