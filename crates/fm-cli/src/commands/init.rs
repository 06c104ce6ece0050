use std::path::Path;

use fm_core::types::Plan;

use super::open_context;

/// Create a new plan document at the configured path.
pub fn run(project_root: &Path, name: &str, max_parallel: usize) -> anyhow::Result<()> {
    let ctx = open_context(project_root)?;
    let plan = Plan::new(name, max_parallel);
    ctx.store.create(&plan)?;

    println!("Initialized plan '{}' at {}", name, ctx.store.path().display());
    println!("  max parallel workers: {}", plan.max_parallel);
    println!();
    println!("Next: fm task add <id> --title <title>");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_plan_document() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), "demo", 3).unwrap();

        let ctx = open_context(dir.path()).unwrap();
        let plan = ctx.store.load().unwrap();
        assert_eq!(plan.name, "demo");
        assert_eq!(plan.max_parallel, 3);
        assert!(plan.tasks.is_empty());
    }

    #[test]
    fn init_refuses_existing_plan() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), "demo", 3).unwrap();
        assert!(run(dir.path(), "again", 1).is_err());
    }
}
