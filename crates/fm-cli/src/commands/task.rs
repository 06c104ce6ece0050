use std::path::Path;

use clap::Subcommand;

use fm_core::plan_store::{Mutation, TaskPatch};
use fm_core::types::Task;

use super::{open_context, parse_complexity, parse_priority};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Add a task to the plan.
    Add {
        /// Stable task id, unique within the plan (e.g. task-0).
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        /// blocker, high, medium, or low.
        #[arg(long, default_value = "medium")]
        priority: String,
        /// trivial, small, medium, large, or complex.
        #[arg(long, default_value = "medium")]
        complexity: String,
        /// Task ids this task depends on (repeatable).
        #[arg(long = "depends")]
        depends_on: Vec<String>,
        /// Paths this task expects to touch (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Edit fields of an existing task.
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        complexity: Option<String>,
        /// Replace the dependency list (repeatable).
        #[arg(long = "depends")]
        depends_on: Option<Vec<String>>,
        /// Replace the file list (repeatable).
        #[arg(long = "file")]
        files: Option<Vec<String>>,
    },
}

pub fn run(project_root: &Path, command: TaskCommands) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;

    match command {
        TaskCommands::Add {
            id,
            title,
            description,
            priority,
            complexity,
            depends_on,
            files,
        } => {
            let mut task = Task::new(
                id.clone(),
                title,
                parse_priority(&priority)?,
                parse_complexity(&complexity)?,
            );
            task.description = description;
            task.depends_on = depends_on;
            task.files = files;

            let priority = task.priority;
            let depends_on = task.depends_on.clone();
            ctx.store.apply(Mutation::AddTask { task })?;
            println!("Added task '{}' ({})", id, priority);
            if !depends_on.is_empty() {
                println!("  depends on: {}", depends_on.join(", "));
            }
        }
        TaskCommands::Edit {
            id,
            title,
            description,
            priority,
            complexity,
            depends_on,
            files,
        } => {
            let patch = TaskPatch {
                title,
                description,
                priority: priority.as_deref().map(parse_priority).transpose()?,
                complexity: complexity.as_deref().map(parse_complexity).transpose()?,
                depends_on,
                files,
            };
            ctx.store.apply(Mutation::UpdateTask {
                task_id: id.clone(),
                patch,
            })?;
            println!("Updated task '{}'", id);
        }
    }
    Ok(())
}
