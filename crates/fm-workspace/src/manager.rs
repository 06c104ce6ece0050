//! Workspace allocation and reclamation.
//!
//! One isolated git worktree per task, at `{workspace_root}/{task-id}` on a
//! dedicated `task/{task-id}` branch. Bindings are recorded in a registry
//! file next to the worktrees so drift between the filesystem and the
//! registration is detectable instead of silently papered over.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use fm_core::types::Task;

use crate::git::{sanitize_name, task_branch, GitRunner, RealGitRunner};
use crate::lockfile::{AcquireResult, LockState, WorkspaceLock, LOCK_FILE_NAME};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git command failed: {0}")]
    GitCommand(String),

    /// Directory and registration disagree. Must be repaired explicitly
    /// before allocation proceeds — never silently overwritten.
    #[error("inconsistent workspace state for '{task_id}': {detail}")]
    InconsistentState { task_id: String, detail: String },

    /// The workspace holds uncommitted modifications; deleting it would
    /// lose work. Requires `force`.
    #[error("workspace has uncommitted changes: {0}")]
    UnsavedWork(String),

    #[error("workspace is locked by a live process (pid {pid}): {path}")]
    Locked { path: String, pid: u32 },

    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub path: String,
    pub branch: String,
    pub task_id: String,
    pub lock: LockState,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    task_id: String,
    path: String,
    branch: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    workspaces: Vec<RegistryEntry>,
}

// ---------------------------------------------------------------------------
// Repair / cleanup guards
// ---------------------------------------------------------------------------

/// How to resolve a directory-vs-registration mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    /// Drop the stale registration, keep whatever is on disk.
    PruneRegistration,
    /// Remove the unregistered directory.
    PruneDirectory,
}

/// Capability token for destructive bulk cleanup. Constructed only through
/// [`CleanupToken::acknowledge_data_loss`], so a caller cannot reach
/// `reclaim_all` by accident.
pub struct CleanupToken(());

impl CleanupToken {
    pub fn acknowledge_data_loss() -> Self {
        Self(())
    }
}

/// What a bulk cleanup actually did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// (path, reason) pairs left in place.
    pub skipped: Vec<(String, String)>,
}

/// A registration/filesystem mismatch found by `audit`.
#[derive(Debug, Clone)]
pub struct Inconsistency {
    pub task_id: Option<String>,
    pub path: String,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Manages per-task worktrees under the workspace root.
pub struct WorkspaceManager {
    project_root: PathBuf,
    workspace_root: PathBuf,
    base_branch: String,
    git: Box<dyn GitRunner>,
}

impl WorkspaceManager {
    /// Create a manager with the real git runner.
    pub fn new(
        project_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            workspace_root: workspace_root.into(),
            base_branch: base_branch.into(),
            git: Box::new(RealGitRunner),
        }
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        project_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        base_branch: impl Into<String>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            workspace_root: workspace_root.into(),
            base_branch: base_branch.into(),
            git,
        }
    }

    pub fn workspace_path(&self, task_id: &str) -> PathBuf {
        self.workspace_root.join(sanitize_name(task_id))
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate a workspace for a task. Idempotent: an existing, correctly
    /// registered workspace is returned as-is. A half-existing one
    /// (directory without registration or the reverse) is an
    /// `InconsistentState` error until `repair` resolves it.
    pub fn allocate(&self, task: &Task) -> Result<Workspace> {
        let dir = self.workspace_path(&task.id);
        let dir_str = dir.display().to_string();
        let mut registry = self.load_registry()?;
        let entry = registry.workspaces.iter().find(|e| e.task_id == task.id);

        match (dir.exists(), entry) {
            (true, Some(entry)) => {
                if entry.path != dir_str {
                    return Err(WorkspaceError::InconsistentState {
                        task_id: task.id.clone(),
                        detail: format!(
                            "registered at '{}' but directory is '{}'",
                            entry.path, dir_str
                        ),
                    });
                }
                Ok(self.to_workspace(entry))
            }
            (true, None) => Err(WorkspaceError::InconsistentState {
                task_id: task.id.clone(),
                detail: format!("directory '{}' exists but is not registered", dir_str),
            }),
            (false, Some(entry)) => Err(WorkspaceError::InconsistentState {
                task_id: task.id.clone(),
                detail: format!("registered at '{}' but directory is missing", entry.path),
            }),
            (false, None) => {
                std::fs::create_dir_all(&self.workspace_root)?;
                let branch = task_branch(&task.id);

                info!(
                    task_id = %task.id,
                    workspace = %dir_str,
                    branch = %branch,
                    base = %self.base_branch,
                    "creating workspace"
                );

                let result = self.git.run_git(
                    &self.project_root,
                    &[
                        "worktree",
                        "add",
                        "-b",
                        &branch,
                        &dir_str,
                        &self.base_branch,
                    ],
                );
                match result {
                    Ok(output) if output.success => {}
                    Ok(output) => return Err(WorkspaceError::GitCommand(output.stderr)),
                    Err(e) => return Err(WorkspaceError::GitCommand(e)),
                }

                let entry = RegistryEntry {
                    task_id: task.id.clone(),
                    path: dir_str,
                    branch,
                    created_at: Utc::now(),
                };
                let workspace = self.to_workspace(&entry);
                registry.workspaces.push(entry);
                self.save_registry(&registry)?;
                Ok(workspace)
            }
        }
    }

    /// Look up the registered workspace for a task.
    pub fn find(&self, task_id: &str) -> Result<Option<Workspace>> {
        let registry = self.load_registry()?;
        Ok(registry
            .workspaces
            .iter()
            .find(|e| e.task_id == task_id)
            .map(|e| self.to_workspace(e)))
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Take the workspace lock for a dispatch run. A stale lock from a dead
    /// process is cleared and the acquire retried once.
    pub fn lock(&self, workspace: &Workspace) -> Result<()> {
        let dir = Path::new(&workspace.path);
        for _ in 0..2 {
            match WorkspaceLock::acquire(dir, &workspace.task_id)? {
                AcquireResult::Acquired => return Ok(()),
                AcquireResult::Held(held) => {
                    return Err(WorkspaceError::Locked {
                        path: workspace.path.clone(),
                        pid: held.pid,
                    });
                }
                AcquireResult::StaleRemoved => continue,
            }
        }
        Err(WorkspaceError::Locked {
            path: workspace.path.clone(),
            pid: 0,
        })
    }

    pub fn unlock(&self, workspace: &Workspace) {
        WorkspaceLock::release(Path::new(&workspace.path));
    }

    // -----------------------------------------------------------------------
    // Reclamation
    // -----------------------------------------------------------------------

    /// Remove a workspace and its registration.
    ///
    /// Refuses when the worktree has uncommitted modifications or a live
    /// lock holder, unless `force` is set.
    pub fn reclaim(&self, workspace: &Workspace, force: bool) -> Result<()> {
        let dir = Path::new(&workspace.path);
        if !dir.exists() {
            return Err(WorkspaceError::NotFound(workspace.path.clone()));
        }

        if !force {
            if let Some(lock) = WorkspaceLock::read(dir) {
                if lock.is_alive() {
                    return Err(WorkspaceError::Locked {
                        path: workspace.path.clone(),
                        pid: lock.pid,
                    });
                }
            }
            if self.has_uncommitted(dir)? {
                return Err(WorkspaceError::UnsavedWork(workspace.path.clone()));
            }
        }

        WorkspaceLock::release(dir);

        let result = self.git.run_git(
            &self.project_root,
            &["worktree", "remove", "--force", &workspace.path],
        );
        match result {
            Ok(output) if output.success => {}
            Ok(output) => return Err(WorkspaceError::GitCommand(output.stderr)),
            Err(e) => return Err(WorkspaceError::GitCommand(e)),
        }

        let mut registry = self.load_registry()?;
        registry.workspaces.retain(|e| e.task_id != workspace.task_id);
        self.save_registry(&registry)?;

        info!(task_id = %workspace.task_id, path = %workspace.path, "workspace reclaimed");
        Ok(())
    }

    /// Destructive bulk cleanup of every registered workspace.
    ///
    /// The `CleanupToken` is the caller's explicit acknowledgement that
    /// in-progress work may be lost; without `force`, workspaces holding
    /// uncommitted changes or live locks are still skipped and reported.
    pub fn reclaim_all(&self, _token: CleanupToken, force: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for workspace in self.inspect()? {
            match self.reclaim(&workspace, force) {
                Ok(()) => report.removed.push(workspace.path),
                Err(e) => {
                    warn!(path = %workspace.path, error = %e, "skipping workspace during bulk cleanup");
                    report.skipped.push((workspace.path, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Inspection / repair
    // -----------------------------------------------------------------------

    /// All registered workspaces with their live lock state.
    pub fn inspect(&self) -> Result<Vec<Workspace>> {
        let registry = self.load_registry()?;
        Ok(registry
            .workspaces
            .iter()
            .map(|e| self.to_workspace(e))
            .collect())
    }

    /// Worktrees git itself knows about under the workspace root — the
    /// third view (besides registry and filesystem) an operator may need
    /// when untangling drift.
    pub fn git_worktrees(&self) -> Result<Vec<crate::git::WorktreeListing>> {
        crate::git::list_worktrees(self.git.as_ref(), &self.project_root, &self.workspace_root)
            .map_err(WorkspaceError::GitCommand)
    }

    /// Registration/filesystem mismatches: registered entries whose
    /// directory is gone, and directories under the workspace root that no
    /// registration claims.
    pub fn audit(&self) -> Result<Vec<Inconsistency>> {
        let registry = self.load_registry()?;
        let mut findings = Vec::new();

        for entry in &registry.workspaces {
            if !Path::new(&entry.path).exists() {
                findings.push(Inconsistency {
                    task_id: Some(entry.task_id.clone()),
                    path: entry.path.clone(),
                    detail: "registered but directory missing".into(),
                });
            }
        }

        if self.workspace_root.exists() {
            for dir_entry in std::fs::read_dir(&self.workspace_root)? {
                let path = dir_entry?.path();
                if !path.is_dir() {
                    continue;
                }
                let path_str = path.display().to_string();
                if !registry.workspaces.iter().any(|e| e.path == path_str) {
                    findings.push(Inconsistency {
                        task_id: None,
                        path: path_str,
                        detail: "directory present but not registered".into(),
                    });
                }
            }
        }

        Ok(findings)
    }

    /// Resolve an inconsistency for the given task id.
    pub fn repair(&self, task_id: &str, strategy: RepairStrategy) -> Result<()> {
        match strategy {
            RepairStrategy::PruneRegistration => {
                let mut registry = self.load_registry()?;
                let before = registry.workspaces.len();
                registry.workspaces.retain(|e| e.task_id != task_id);
                if registry.workspaces.len() == before {
                    return Err(WorkspaceError::NotFound(task_id.to_string()));
                }
                self.save_registry(&registry)?;
                info!(task_id, "pruned stale workspace registration");
            }
            RepairStrategy::PruneDirectory => {
                let dir = self.workspace_path(task_id);
                if !dir.exists() {
                    return Err(WorkspaceError::NotFound(dir.display().to_string()));
                }
                let dir_str = dir.display().to_string();
                // Try the worktree-aware removal first; fall back to a plain
                // delete for directories git does not know about.
                let removed = self
                    .git
                    .run_git(
                        &self.project_root,
                        &["worktree", "remove", "--force", &dir_str],
                    )
                    .map(|o| o.success)
                    .unwrap_or(false);
                if !removed {
                    std::fs::remove_dir_all(&dir)?;
                }
                info!(task_id, path = %dir_str, "pruned unregistered workspace directory");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// `git status --porcelain`, ignoring the lockfile the manager itself
    /// plants in the worktree.
    fn has_uncommitted(&self, dir: &Path) -> Result<bool> {
        let output = self
            .git
            .run_git(dir, &["status", "--porcelain"])
            .map_err(WorkspaceError::GitCommand)?;
        if !output.success {
            return Err(WorkspaceError::GitCommand(output.stderr));
        }
        Ok(output
            .stdout
            .lines()
            .any(|line| !line.trim().is_empty() && !line.ends_with(LOCK_FILE_NAME)))
    }

    fn to_workspace(&self, entry: &RegistryEntry) -> Workspace {
        Workspace {
            path: entry.path.clone(),
            branch: entry.branch.clone(),
            task_id: entry.task_id.clone(),
            lock: WorkspaceLock::state(Path::new(&entry.path)),
            created_at: entry.created_at,
        }
    }

    fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("registry.json")
    }

    fn load_registry(&self) -> Result<Registry> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(Registry::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save_registry(&self, registry: &Registry) -> Result<()> {
        std::fs::create_dir_all(&self.workspace_root)?;
        let tmp = self.registry_path().with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(registry)?)?;
        std::fs::rename(&tmp, self.registry_path())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
