use std::path::Path;

use fm_core::plan_store::Mutation;
use fm_core::resolver;

use super::open_context;

/// Allocate a workspace for every ready task and bind it in the plan.
///
/// Inconsistent workspaces are reported but do not stop the other
/// allocations; repair them with `fm cleanup`.
pub fn run(project_root: &Path) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;
    let plan = ctx.store.load()?;
    let ready: Vec<_> = resolver::ready_tasks(&plan)
        .into_iter()
        .cloned()
        .collect();

    if ready.is_empty() {
        println!("No ready tasks; nothing to allocate.");
        return Ok(());
    }

    let mut failures = 0usize;
    for task in &ready {
        match ctx.manager.allocate(task) {
            Ok(workspace) => {
                ctx.store.apply(Mutation::AttachWorkspace {
                    task_id: task.id.clone(),
                    path: workspace.path.clone(),
                })?;
                println!("  {} -> {} ({})", task.id, workspace.path, workspace.branch);
            }
            Err(e) => {
                failures += 1;
                eprintln!("  {}: {}", task.id, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} workspace allocation(s) failed");
    }
    println!("Allocated {} workspace(s).", ready.len());
    Ok(())
}
