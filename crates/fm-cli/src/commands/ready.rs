use std::path::Path;

use fm_core::resolver;

use super::open_context;

/// Show the ready frontier in dispatch order, with advisory file-overlap
/// warnings for tasks that would run concurrently.
pub fn run(project_root: &Path) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;
    let plan = ctx.store.load()?;
    let ready = resolver::ready_tasks(&plan);

    if ready.is_empty() {
        if plan.is_finished() {
            println!("All tasks are terminal; nothing to dispatch.");
        } else {
            println!("No task is ready; waiting on dependencies or operator action.");
        }
        return Ok(());
    }

    println!("Ready tasks ({}):", ready.len());
    for task in &ready {
        println!("  {} [{}] {}", task.id, task.priority, task.title);
        if !task.depends_on.is_empty() {
            println!("      deps completed: {}", task.depends_on.join(", "));
        }
    }

    let conflicts = resolver::file_conflicts(&ready);
    if !conflicts.is_empty() {
        println!();
        println!("Warning: overlapping file lists (advisory, tasks will still run):");
        for conflict in conflicts {
            println!("  {}", conflict);
        }
    }
    Ok(())
}
