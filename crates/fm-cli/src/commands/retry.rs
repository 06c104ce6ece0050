use std::path::Path;

use super::open_context;

/// Return a blocked task to `pending` so the next run can retry it. Its
/// workspace (if any) is kept for the new attempt.
pub fn run(project_root: &Path, task_id: &str) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;
    ctx.sync.retry(task_id)?;
    println!("Task '{task_id}' returned to pending.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{init, task::TaskCommands};
    use fm_core::types::{OutcomeStatus, TaskStatus, WorkerOutcome};

    #[test]
    fn retry_reopens_blocked_task() {
        let dir = tempfile::tempdir().unwrap();
        init::run(dir.path(), "demo", 1).unwrap();
        crate::commands::task::run(
            dir.path(),
            TaskCommands::Add {
                id: "a".into(),
                title: "A".into(),
                description: None,
                priority: "medium".into(),
                complexity: "medium".into(),
                depends_on: vec![],
                files: vec![],
            },
        )
        .unwrap();

        let ctx = open_context(dir.path()).unwrap();
        ctx.sync.assign("a").unwrap();
        ctx.sync.start("a").unwrap();
        let mut outcome = WorkerOutcome::failed("worker crashed");
        outcome.status = OutcomeStatus::Failed;
        ctx.sync.finish("a", &outcome).unwrap();

        run(dir.path(), "a").unwrap();
        let plan = ctx.store.load().unwrap();
        assert_eq!(plan.task("a").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn retry_rejects_non_blocked_task() {
        let dir = tempfile::tempdir().unwrap();
        init::run(dir.path(), "demo", 1).unwrap();
        crate::commands::task::run(
            dir.path(),
            TaskCommands::Add {
                id: "a".into(),
                title: "A".into(),
                description: None,
                priority: "medium".into(),
                complexity: "medium".into(),
                depends_on: vec![],
                files: vec![],
            },
        )
        .unwrap();

        assert!(run(dir.path(), "a").is_err());
    }
}
