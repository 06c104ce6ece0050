use std::path::Path;

use fm_workspace::reconciler::{MergeOutcome, ReconcileError, Reconciler};

use super::{open_context, CliContext};
use crate::exit_codes;

/// Merge completed tasks back to the integration line. Returns the exit
/// code: `MERGE_CONFLICT` when anything conflicted, `OK` otherwise.
pub fn run(
    project_root: &Path,
    task: Option<String>,
    allow_failing_tests: bool,
) -> anyhow::Result<i32> {
    let ctx = open_context(project_root)?;
    let reconciler = build_reconciler(&ctx);

    match task {
        Some(task_id) => {
            match reconciler.merge(&task_id, allow_failing_tests) {
                Ok(MergeOutcome::Merged) => println!("Merged '{task_id}'."),
                Ok(MergeOutcome::NothingToMerge) => {
                    println!("'{task_id}' had no changes to merge.");
                }
                Err(ReconcileError::MergeConflict(files)) => {
                    println!("Merge conflict on '{task_id}':");
                    for file in files {
                        println!("  {file}");
                    }
                    println!("Task stays completed but un-merged (pending merge).");
                    return Ok(exit_codes::MERGE_CONFLICT);
                }
                Err(e) => return Err(e.into()),
            }
            print_unblocked(&reconciler, &task_id)?;
            Ok(exit_codes::OK)
        }
        None => {
            let report = reconciler.reconcile_all(allow_failing_tests)?;
            for task_id in &report.merged {
                println!("Merged '{task_id}'.");
                print_unblocked(&reconciler, task_id)?;
            }
            for (task_id, files) in &report.conflicts {
                println!("Merge conflict on '{task_id}': {}", files.join(", "));
            }
            for (task_id, reason) in &report.skipped {
                println!("Skipped '{task_id}': {reason}");
            }
            if report.merged.is_empty() && report.conflicts.is_empty() && report.skipped.is_empty()
            {
                println!("Nothing to reconcile.");
            }
            if report.conflicts.is_empty() {
                Ok(exit_codes::OK)
            } else {
                Ok(exit_codes::MERGE_CONFLICT)
            }
        }
    }
}

fn build_reconciler(ctx: &CliContext) -> Reconciler {
    Reconciler::new(
        ctx.project_root.clone(),
        ctx.sync.clone(),
        ctx.manager.clone(),
        ctx.config.git.base_branch.clone(),
        ctx.config.git.delete_merged_branches,
    )
}

fn print_unblocked(reconciler: &Reconciler, task_id: &str) -> anyhow::Result<()> {
    let unblocked = reconciler.unblocked_after(task_id)?;
    if !unblocked.is_empty() {
        println!("  now unblocked: {}", unblocked.join(", "));
    }
    Ok(())
}
