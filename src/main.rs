//! Weaver CLI entrypoint.

use clap::Parser;
use std::ffi::OsString;
use std::process;
use weaver::cli::commands::{
    CheckpointCommands, Cli, Commands, PhaseArg, ServeArgs, StatusArg, StrategyArg,
    StreamCommands, TaskCommands, TaskCreateArgs, TaskListArgs, TaskUpdateArgs,
    WorktreeCommands,
};
use weaver::cli::output::{create_table, output, output_error, OutputFormat};
use weaver::core::checkpoint::{CheckpointTrigger, CleanupFilter, CreateCheckpoint};
use weaver::core::coordinator::Coordinator;
use weaver::core::error::ExitCode;
use weaver::core::store::{NewTask, TaskFilter, TaskPatch};
use weaver::core::task::{StreamPhase, Task, TaskMeta, TaskStatus};
use weaver::core::worktree::ResolveStrategy;
use weaver::server::{serve, ServeConfig};

fn parse_format_from_args(args: &[OsString]) -> OutputFormat {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let s = arg.to_string_lossy();

        if s == "-f" || s == "--format" {
            if let Some(value) = iter.next() {
                return parse_format_value(&value.to_string_lossy());
            }
        }

        if let Some(value) = s.strip_prefix("--format=") {
            return parse_format_value(value);
        }
    }

    OutputFormat::Table
}

fn parse_format_value(value: &str) -> OutputFormat {
    let v = value.to_lowercase();
    if v == "json" {
        OutputFormat::Json
    } else if v == "yaml" || v == "yml" {
        OutputFormat::Yaml
    } else {
        OutputFormat::Table
    }
}

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();
    let format = parse_format_from_args(&args);

    match Cli::try_parse_from(&args) {
        Ok(cli) => process::exit(i32::from(run(cli, format))),
        Err(e) => {
            let _ = e.print();
            process::exit(2);
        }
    }
}

fn run(cli: Cli, format: OutputFormat) -> ExitCode {
    match cli.command {
        Some(Commands::Version) => {
            println!("weaver {}", env!("CARGO_PKG_VERSION"));
            ExitCode::Success
        }
        Some(Commands::Serve(args)) => handle_serve(&args),
        Some(Commands::Task(cmd)) => handle_task(cmd, format),
        Some(Commands::Stream(cmd)) => handle_stream(cmd, format),
        Some(Commands::Checkpoint(cmd)) => handle_checkpoint(cmd, format),
        Some(Commands::Worktree(cmd)) => handle_worktree(cmd, format),
        None => {
            println!("weaver {}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for usage information.");
            ExitCode::Success
        }
    }
}

fn get_coordinator(format: OutputFormat) -> Option<Coordinator> {
    match Coordinator::open() {
        Ok(c) => Some(c),
        Err(e) => {
            output_error(&e, format);
            None
        }
    }
}

fn handle_serve(args: &ServeArgs) -> ExitCode {
    let config = ServeConfig {
        host: args.host.clone(),
        port: args.port,
        events_limit: args.events_limit,
    };
    match serve(&config) {
        Ok(()) => ExitCode::Success,
        Err(e) => output_error(&e, OutputFormat::Table),
    }
}

fn phase_from_arg(phase: Option<PhaseArg>) -> StreamPhase {
    match phase {
        Some(PhaseArg::Foundation) => StreamPhase::Foundation,
        Some(PhaseArg::Integration) => StreamPhase::Integration,
        Some(PhaseArg::Parallel) | None => StreamPhase::Parallel,
    }
}

fn status_from_arg(status: StatusArg) -> TaskStatus {
    match status {
        StatusArg::Pending => TaskStatus::Pending,
        StatusArg::InProgress => TaskStatus::InProgress,
        StatusArg::Blocked => TaskStatus::Blocked,
        StatusArg::Completed => TaskStatus::Completed,
        StatusArg::Cancelled => TaskStatus::Cancelled,
    }
}

fn handle_task(cmd: TaskCommands, format: OutputFormat) -> ExitCode {
    let Some(coordinator) = get_coordinator(format) else {
        return ExitCode::Error;
    };

    match cmd {
        TaskCommands::Create(args) => handle_task_create(&coordinator, args, format),
        TaskCommands::Update(args) => handle_task_update(&coordinator, args, format),
        TaskCommands::Show(args) => match coordinator.get_task(args.id) {
            Ok(task) => {
                print_task(&task, format);
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        TaskCommands::List(args) => handle_task_list(&coordinator, &args, format),
    }
}

fn handle_task_create(
    coordinator: &Coordinator,
    args: TaskCreateArgs,
    format: OutputFormat,
) -> ExitCode {
    let meta = match args.stream {
        Some(stream_id) => TaskMeta::StreamScoped {
            stream_id,
            phase: phase_from_arg(args.phase),
            files: args.files,
            depends_on: args.depends_on,
        },
        None => TaskMeta::Unscoped,
    };

    match coordinator.create_task(NewTask {
        title: args.title,
        parent_id: args.parent,
        agent: args.agent,
        meta,
    }) {
        Ok(write) => {
            for warning in &write.warnings {
                eprintln!("Warning [{}]: {}", warning.code, warning.message);
            }
            print_task(&write.task, format);
            ExitCode::Success
        }
        Err(e) => output_error(&e, format),
    }
}

fn handle_task_update(
    coordinator: &Coordinator,
    args: TaskUpdateArgs,
    format: OutputFormat,
) -> ExitCode {
    let patch = TaskPatch {
        title: args.title,
        status: args.status.map(status_from_arg),
        blocked_reason: args.reason,
        agent: args.agent,
        ..TaskPatch::default()
    };

    match coordinator.update_task(args.id, patch) {
        Ok(write) => {
            for warning in &write.warnings {
                eprintln!("Warning [{}]: {}", warning.code, warning.message);
            }
            print_task(&write.task, format);
            ExitCode::Success
        }
        Err(e) => output_error(&e, format),
    }
}

fn handle_task_list(
    coordinator: &Coordinator,
    args: &TaskListArgs,
    format: OutputFormat,
) -> ExitCode {
    let filter = TaskFilter {
        stream: args.stream.clone(),
        status: args.status.map(status_from_arg),
        agent: args.agent.clone(),
        parent: args.parent,
    };
    print_tasks(&coordinator.list_tasks(&filter), format);
    ExitCode::Success
}

fn handle_stream(cmd: StreamCommands, format: OutputFormat) -> ExitCode {
    let Some(coordinator) = get_coordinator(format) else {
        return ExitCode::Error;
    };

    match cmd {
        StreamCommands::List => {
            let streams = coordinator.list_streams();
            match format {
                OutputFormat::Table => {
                    if streams.is_empty() {
                        println!("No streams found.");
                        return ExitCode::Success;
                    }
                    let mut table = create_table(&[
                        "STREAM", "PHASE", "TASKS", "DONE%", "BLOCKED", "READY",
                    ]);
                    for s in &streams {
                        table.add_row(vec![
                            s.id.clone(),
                            s.phase.to_string(),
                            s.total.to_string(),
                            format!("{}%", s.progress_pct),
                            s.blocked.to_string(),
                            if s.ready { "yes" } else { "no" }.to_string(),
                        ]);
                    }
                    println!("{table}");
                }
                _ => {
                    if let Err(err) = output(&streams, format) {
                        eprintln!("Failed to render streams: {err}");
                    }
                }
            }
            ExitCode::Success
        }
        StreamCommands::Show(args) => match coordinator.get_stream(&args.id) {
            Ok((stream, tasks)) => {
                if let Err(err) = output(
                    serde_json::json!({ "stream": stream, "tasks": tasks }),
                    format,
                ) {
                    eprintln!("Failed to render stream: {err}");
                }
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        StreamCommands::Conflicts(args) => {
            let claims = coordinator.check_conflicts(&args.files, args.exclude.as_deref());
            if claims.is_empty() {
                if format == OutputFormat::Table {
                    println!("No conflicts.");
                } else if let Err(err) = output(&claims, format) {
                    eprintln!("Failed to render claims: {err}");
                }
                return ExitCode::Success;
            }
            if format == OutputFormat::Table {
                for claim in &claims {
                    println!(
                        "{}  claimed by stream '{}' (task {}, {})",
                        claim.file, claim.stream_id, claim.task_id, claim.task_status
                    );
                }
            } else if let Err(err) = output(&claims, format) {
                eprintln!("Failed to render claims: {err}");
            }
            ExitCode::Conflict
        }
    }
}

fn handle_checkpoint(cmd: CheckpointCommands, format: OutputFormat) -> ExitCode {
    let Some(coordinator) = get_coordinator(format) else {
        return ExitCode::Error;
    };

    match cmd {
        CheckpointCommands::Create(args) => {
            let context = args
                .context
                .iter()
                .map(|entry| {
                    let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
                    (key.to_string(), serde_json::Value::from(value))
                })
                .collect();
            let params = CreateCheckpoint {
                phase: args.phase,
                step: args.step,
                context,
                draft: args.draft.map(|content| (content, args.draft_kind)),
                expiry_minutes: args.expires_in,
            };
            match coordinator.create_checkpoint(args.task, CheckpointTrigger::Manual, params) {
                Ok(checkpoint) => {
                    if let Err(err) = output(&checkpoint, format) {
                        eprintln!("Failed to render checkpoint: {err}");
                    }
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
        CheckpointCommands::Resume(args) => {
            match coordinator.resume_checkpoint(args.task, args.checkpoint) {
                Ok(state) => {
                    if state.fallback {
                        eprintln!("Requested checkpoint unavailable; resumed from latest valid.");
                    }
                    if let Err(err) = output(&state, format) {
                        eprintln!("Failed to render resume state: {err}");
                    }
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
        CheckpointCommands::List(args) => {
            match coordinator.list_checkpoints(args.task, args.limit) {
                Ok(checkpoints) => {
                    if let Err(err) = output(&checkpoints, format) {
                        eprintln!("Failed to render checkpoints: {err}");
                    }
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
        CheckpointCommands::Cleanup(args) => {
            let filter = CleanupFilter {
                task_id: args.task,
                older_than_minutes: args.older_than,
                keep_latest: args.keep_latest,
            };
            match coordinator.cleanup_checkpoints(&filter) {
                Ok(deleted) => {
                    println!("Deleted {deleted} checkpoint(s).");
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
    }
}

fn handle_worktree(cmd: WorktreeCommands, format: OutputFormat) -> ExitCode {
    let Some(coordinator) = get_coordinator(format) else {
        return ExitCode::Error;
    };

    match cmd {
        WorktreeCommands::Status(args) => match coordinator.worktree_status(args.task) {
            Ok(status) => {
                if let Err(err) = output(&status, format) {
                    eprintln!("Failed to render worktree status: {err}");
                }
                ExitCode::Success
            }
            Err(e) => output_error(&e, format),
        },
        WorktreeCommands::Resolve(args) => {
            let strategy = match args.strategy {
                StrategyArg::Ours => ResolveStrategy::Ours,
                StrategyArg::Theirs => ResolveStrategy::Theirs,
                StrategyArg::Manual => ResolveStrategy::Manual,
            };
            match coordinator.resolve_worktree(args.task, strategy) {
                Ok(()) => {
                    println!("Merge resolved for task {}.", args.task);
                    ExitCode::Success
                }
                Err(e) => output_error(&e, format),
            }
        }
    }
}

fn print_task(task: &Task, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("ID:      {}", task.id);
            println!("Title:   {}", task.title);
            println!("Status:  {}", task.status);
            if let Some(reason) = &task.blocked_reason {
                println!("Blocked: {reason}");
            }
            if let Some(agent) = &task.agent {
                println!("Agent:   {agent}");
            }
            if let Some(stream_id) = task.meta.stream_id() {
                println!("Stream:  {stream_id}");
            }
            if let Some(parent_id) = task.parent_id {
                println!("Parent:  {parent_id}");
            }
        }
        _ => {
            if let Err(err) = output(task, format) {
                eprintln!("Failed to render task: {err}");
            }
        }
    }
}

fn print_tasks(tasks: &[Task], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No tasks found.");
                return;
            }
            let mut table = create_table(&["ID", "STATUS", "STREAM", "TITLE"]);
            for t in tasks {
                table.add_row(vec![
                    t.id.to_string(),
                    t.status.to_string(),
                    t.meta.stream_id().unwrap_or("-").to_string(),
                    t.title.clone(),
                ]);
            }
            println!("{table}");
        }
        _ => {
            if let Err(err) = output(tasks, format) {
                eprintln!("Failed to render tasks: {err}");
            }
        }
    }
}
