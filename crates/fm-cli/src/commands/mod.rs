pub mod allocate;
pub mod cleanup;
pub mod graph;
pub mod init;
pub mod ready;
pub mod reconcile;
pub mod retry;
pub mod run;
pub mod status;
pub mod task;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use fm_core::config::ForemanConfig;
use fm_core::plan_store::PlanStore;
use fm_core::status::StatusSync;
use fm_core::types::{TaskComplexity, TaskPriority};
use fm_workspace::manager::WorkspaceManager;

/// Shared handles every subcommand works through.
pub struct CliContext {
    pub project_root: PathBuf,
    pub config: ForemanConfig,
    pub store: Arc<PlanStore>,
    pub sync: StatusSync,
    pub manager: Arc<WorkspaceManager>,
}

/// Open config, plan store, and workspace manager for the project root.
pub fn open_context(project_root: &Path) -> anyhow::Result<CliContext> {
    let config = ForemanConfig::load(project_root).context("loading foreman.toml")?;
    let store = Arc::new(PlanStore::new(config.plan_path(project_root)));
    let sync = StatusSync::new(store.clone());
    let manager = Arc::new(WorkspaceManager::new(
        project_root,
        config.workspace_root(project_root),
        config.git.base_branch.clone(),
    ));
    Ok(CliContext {
        project_root: project_root.to_path_buf(),
        config,
        store,
        sync,
        manager,
    })
}

pub fn parse_priority(value: &str) -> anyhow::Result<TaskPriority> {
    match value {
        "blocker" => Ok(TaskPriority::Blocker),
        "high" => Ok(TaskPriority::High),
        "medium" => Ok(TaskPriority::Medium),
        "low" => Ok(TaskPriority::Low),
        other => anyhow::bail!("invalid priority '{other}': must be blocker, high, medium, or low"),
    }
}

pub fn parse_complexity(value: &str) -> anyhow::Result<TaskComplexity> {
    match value {
        "trivial" => Ok(TaskComplexity::Trivial),
        "small" => Ok(TaskComplexity::Small),
        "medium" => Ok(TaskComplexity::Medium),
        "large" => Ok(TaskComplexity::Large),
        "complex" => Ok(TaskComplexity::Complex),
        other => anyhow::bail!(
            "invalid complexity '{other}': must be trivial, small, medium, large, or complex"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parsing() {
        assert_eq!(parse_priority("blocker").unwrap(), TaskPriority::Blocker);
        assert_eq!(parse_priority("low").unwrap(), TaskPriority::Low);
        assert!(parse_priority("urgent").is_err());
    }

    #[test]
    fn complexity_parsing() {
        assert_eq!(parse_complexity("trivial").unwrap(), TaskComplexity::Trivial);
        assert!(parse_complexity("huge").is_err());
    }
}
