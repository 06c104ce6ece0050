use std::path::Path;

use fm_core::types::{MergeState, Plan, TaskStatus};

use super::open_context;

/// Show per-task state, the status rollup, and overall completion.
pub fn run(project_root: &Path) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;
    let plan = ctx.store.load()?;
    print!("{}", render(&plan));
    Ok(())
}

fn render(plan: &Plan) -> String {
    let mut out = String::new();

    out.push_str(&format!("Plan '{}'  (revision {})\n", plan.name, plan.revision));
    out.push_str(&format!("{}\n", "-".repeat(60)));

    for task in &plan.tasks {
        let merge_note = match task.merge_state {
            MergeState::Merged => "  [merged]",
            MergeState::PendingMerge => "  [pending merge]",
            MergeState::NotMerged => "",
        };
        out.push_str(&format!(
            "{:<14} {:<12} {:<8} {}{}\n",
            task.id,
            task.status.to_string(),
            task.priority.to_string(),
            task.title,
            merge_note,
        ));
        if let Some(workspace) = &task.workspace {
            out.push_str(&format!("{:<14} workspace: {}\n", "", workspace));
        }
        if task.status == TaskStatus::Blocked {
            if let Some(error) = task.results.as_ref().and_then(|r| r.error.as_deref()) {
                out.push_str(&format!("{:<14} error: {}\n", "", error));
            }
        }
    }

    out.push_str(&format!("{}\n", "-".repeat(60)));
    for (status, count) in plan.status_counts() {
        if count > 0 {
            out.push_str(&format!("  {:<12} {}\n", status.to_string(), count));
        }
    }

    let total = plan.tasks.len();
    let completed = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    if total > 0 {
        let percent = completed * 100 / total;
        out.push_str(&format!("\nCompleted: {completed} / {total} ({percent}%)\n"));
    } else {
        out.push_str("\nPlan has no tasks yet.\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::{Task, TaskComplexity, TaskPriority, TaskResults};

    #[test]
    fn render_shows_rollup_and_percent() {
        let mut plan = Plan::new("demo", 2);
        let mut a = Task::new("task-0", "Models", TaskPriority::Blocker, TaskComplexity::Small);
        a.status = TaskStatus::Completed;
        a.merge_state = MergeState::Merged;
        let mut b = Task::new("task-1", "Routes", TaskPriority::High, TaskComplexity::Medium);
        b.status = TaskStatus::Blocked;
        b.results = Some(TaskResults {
            commits: 0,
            files_changed: vec![],
            tests_passed: false,
            summary: String::new(),
            error: Some("worker timed out after 900s".into()),
        });
        plan.tasks = vec![a, b];

        let text = render(&plan);
        assert!(text.contains("task-0"));
        assert!(text.contains("[merged]"));
        assert!(text.contains("worker timed out"));
        assert!(text.contains("Completed: 1 / 2 (50%)"));
        assert!(text.contains("blocked"));
    }

    #[test]
    fn render_handles_empty_plan() {
        let plan = Plan::new("empty", 1);
        assert!(render(&plan).contains("no tasks"));
    }
}
