mod commands;
mod exit_codes;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::graph::GraphFormat;
use commands::task::TaskCommands;
use fm_core::plan_store::PlanError;
use fm_workspace::manager::WorkspaceError;
use fm_workspace::reconciler::ReconcileError;

/// fm -- dispatch parallel workers over a dependency-ordered task plan.
#[derive(Parser)]
#[command(name = "fm", version, about)]
struct Cli {
    /// Project root holding foreman.toml and the plan document.
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new plan document.
    Init {
        /// Plan name.
        name: String,
        /// Concurrency limit for dispatched workers.
        #[arg(long, default_value_t = 4)]
        max_parallel: usize,
    },

    /// Add or edit plan tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Show tasks ready to dispatch.
    Ready,

    /// Allocate workspaces for every ready task.
    Allocate,

    /// Dispatch workers until the plan settles (Ctrl-C cancels).
    Run {
        /// Override the plan's concurrency limit.
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Override the per-worker timeout from foreman.toml.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show plan status and completion stats.
    Status,

    /// Render the dependency graph.
    Graph {
        #[arg(long, value_enum, default_value = "text")]
        format: GraphFormat,
    },

    /// Merge completed tasks back to the integration line.
    Reconcile {
        /// Merge a single task instead of all eligible ones.
        #[arg(long)]
        task: Option<String>,
        /// Merge even when the task's tests failed.
        #[arg(long)]
        allow_failing_tests: bool,
    },

    /// Return a blocked task to pending for another attempt.
    Retry {
        /// Task id to reopen.
        task: String,
    },

    /// Inspect or reclaim workspaces.
    Cleanup {
        /// Reclaim the workspace of a single task.
        #[arg(long)]
        task: Option<String>,
        /// Reclaim every registered workspace.
        #[arg(long)]
        all: bool,
        /// Override the unsaved-work and live-lock guards.
        #[arg(long)]
        force: bool,
        /// Required with --all: acknowledge that in-progress work may be lost.
        #[arg(long)]
        yes_delete_work: bool,
        /// Resolve a registration/directory mismatch for the given task.
        #[arg(long)]
        repair: Option<String>,
        /// With --repair: prune the stale "registration" or the stray "directory".
        #[arg(long, default_value = "registration")]
        strategy: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    let cli = Cli::parse();
    let root = cli.project_root;

    let result: anyhow::Result<i32> = match cli.command {
        Commands::Init { name, max_parallel } => {
            commands::init::run(&root, &name, max_parallel).map(|()| exit_codes::OK)
        }
        Commands::Task { command } => commands::task::run(&root, command).map(|()| exit_codes::OK),
        Commands::Ready => commands::ready::run(&root).map(|()| exit_codes::OK),
        Commands::Allocate => commands::allocate::run(&root).map(|()| exit_codes::OK),
        Commands::Run {
            max_parallel,
            timeout_secs,
        } => commands::run::run(&root, max_parallel, timeout_secs).await,
        Commands::Status => commands::status::run(&root).map(|()| exit_codes::OK),
        Commands::Graph { format } => commands::graph::run(&root, format).map(|()| exit_codes::OK),
        Commands::Reconcile {
            task,
            allow_failing_tests,
        } => commands::reconcile::run(&root, task, allow_failing_tests),
        Commands::Retry { task } => commands::retry::run(&root, &task).map(|()| exit_codes::OK),
        Commands::Cleanup {
            task,
            all,
            force,
            yes_delete_work,
            repair,
            strategy,
        } => commands::cleanup::run(&root, task, all, force, yes_delete_work, repair, &strategy)
            .map(|()| exit_codes::OK),
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}

/// Map error types onto the stable exit codes.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(plan_err) = err.downcast_ref::<PlanError>() {
        return match plan_err {
            PlanError::Cycle(_) => exit_codes::CYCLE,
            PlanError::Validation(_)
            | PlanError::StaleTransition { .. }
            | PlanError::InvalidTransition { .. }
            | PlanError::UnknownTask(_) => exit_codes::VALIDATION,
            _ => exit_codes::FAILURE,
        };
    }
    if let Some(ws_err) = err.downcast_ref::<WorkspaceError>() {
        return match ws_err {
            WorkspaceError::UnsavedWork(_) => exit_codes::UNSAVED_WORK,
            WorkspaceError::InconsistentState { .. } => exit_codes::VALIDATION,
            _ => exit_codes::FAILURE,
        };
    }
    if let Some(rec_err) = err.downcast_ref::<ReconcileError>() {
        return match rec_err {
            ReconcileError::MergeConflict(_) => exit_codes::MERGE_CONFLICT,
            ReconcileError::Plan(PlanError::Cycle(_)) => exit_codes::CYCLE,
            ReconcileError::Workspace(WorkspaceError::UnsavedWork(_)) => exit_codes::UNSAVED_WORK,
            _ => exit_codes::FAILURE,
        };
    }
    if let Some(pool_err) = err.downcast_ref::<fm_dispatch::pool::PoolError>() {
        return match pool_err {
            fm_dispatch::pool::PoolError::Plan(PlanError::Cycle(_)) => exit_codes::CYCLE,
            fm_dispatch::pool::PoolError::Plan(_) => exit_codes::VALIDATION,
        };
    }
    exit_codes::FAILURE
}
