use std::path::Path;

use fm_core::plan_store::Mutation;
use fm_workspace::manager::{CleanupToken, RepairStrategy};

use super::open_context;

/// Inspect or reclaim workspaces.
///
/// With no arguments, lists registered workspaces and any drift between
/// registry, filesystem, and git. `--task` reclaims one workspace;
/// `--all` requires `--yes-delete-work` (the explicit acknowledgement
/// that in-progress work may be lost). `--force` overrides the
/// unsaved-work and live-lock guards. `--repair` resolves a
/// registration/directory mismatch reported by the inspection.
#[allow(clippy::too_many_arguments)]
pub fn run(
    project_root: &Path,
    task: Option<String>,
    all: bool,
    force: bool,
    yes_delete_work: bool,
    repair: Option<String>,
    strategy: &str,
) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;

    if let Some(task_id) = repair {
        let strategy = match strategy {
            "registration" => RepairStrategy::PruneRegistration,
            "directory" => RepairStrategy::PruneDirectory,
            other => anyhow::bail!(
                "invalid repair strategy '{other}': must be registration or directory"
            ),
        };
        ctx.manager.repair(&task_id, strategy)?;
        println!("Repaired workspace state for '{task_id}'.");
        return Ok(());
    }

    match (task, all) {
        (Some(task_id), _) => {
            let workspace = ctx
                .manager
                .find(&task_id)?
                .ok_or_else(|| anyhow::anyhow!("no workspace registered for '{task_id}'"))?;
            ctx.manager.reclaim(&workspace, force)?;
            // The plan may not know this task (e.g. repaired drift); only
            // detach a binding that exists.
            if ctx.store.exists() {
                let plan = ctx.store.load()?;
                if plan.task(&task_id).is_some_and(|t| t.workspace.is_some()) {
                    ctx.store.apply(Mutation::DetachWorkspace { task_id })?;
                }
            }
            println!("Reclaimed {}", workspace.path);
        }
        (None, true) => {
            if !yes_delete_work {
                anyhow::bail!(
                    "refusing bulk cleanup without --yes-delete-work (this can delete in-progress work)"
                );
            }
            let report = ctx
                .manager
                .reclaim_all(CleanupToken::acknowledge_data_loss(), force)?;
            for path in &report.removed {
                println!("Reclaimed {path}");
            }
            for (path, reason) in &report.skipped {
                println!("Skipped {path}: {reason}");
            }
            if ctx.store.exists() {
                let plan = ctx.store.load()?;
                for task in plan.tasks.iter().filter(|t| t.workspace.is_some()) {
                    let gone = report
                        .removed
                        .iter()
                        .any(|p| Some(p.as_str()) == task.workspace.as_deref());
                    if gone {
                        ctx.store.apply(Mutation::DetachWorkspace {
                            task_id: task.id.clone(),
                        })?;
                    }
                }
            }
        }
        (None, false) => {
            let workspaces = ctx.manager.inspect()?;
            if workspaces.is_empty() {
                println!("No registered workspaces.");
            } else {
                println!("Registered workspaces:");
                for ws in &workspaces {
                    println!("  {} [{:?}] {} ({})", ws.task_id, ws.lock, ws.path, ws.branch);
                }
            }

            let findings = ctx.manager.audit()?;
            if !findings.is_empty() {
                println!();
                println!("Inconsistencies (repair before allocating):");
                for finding in &findings {
                    match &finding.task_id {
                        Some(id) => println!("  {}: {} ({})", id, finding.detail, finding.path),
                        None => println!("  {} ({})", finding.detail, finding.path),
                    }
                }
            }

            if let Ok(worktrees) = ctx.manager.git_worktrees() {
                if !worktrees.is_empty() {
                    println!();
                    println!("Worktrees known to git:");
                    for wt in worktrees {
                        println!("  {} ({})", wt.path, wt.branch);
                    }
                }
            }
        }
    }
    Ok(())
}
