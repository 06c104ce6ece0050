//! Reconciliation: merging completed task branches back to the integration
//! line and reclaiming their workspaces.
//!
//! Merges are gated — completed status, green tests (unless explicitly
//! overridden), not already merged. A conflicting merge is aborted and the
//! task is parked in the `pending_merge` sub-state with its branch intact;
//! nothing is ever discarded to make a merge "succeed".

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use fm_core::plan_store::{Mutation, PlanError};
use fm_core::resolver;
use fm_core::status::StatusSync;
use fm_core::types::{MergeState, TaskStatus};

use crate::git::{GitRunner, RealGitRunner};
use crate::manager::{WorkspaceError, WorkspaceManager};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Merge blocked by conflicting paths; the task stays completed but
    /// un-merged (`pending_merge`).
    #[error("merge conflicts in: {}", .0.join(", "))]
    MergeConflict(Vec<String>),

    #[error("task '{0}' has failing tests; pass --allow-failing-tests to merge anyway")]
    TestsFailing(String),

    #[error("task '{task_id}' is {status}, only completed tasks reconcile")]
    NotCompleted { task_id: String, status: TaskStatus },

    #[error("task '{0}' is already merged")]
    AlreadyMerged(String),

    #[error("git command failed: {0}")]
    GitCommand(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Branch merged and workspace reclaimed.
    Merged,
    /// The branch had no delta against the integration line.
    NothingToMerge,
}

/// What a full reconcile pass did. Per-task failures never abort the rest.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub merged: Vec<String>,
    pub conflicts: Vec<(String, Vec<String>)>,
    pub skipped: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    project_root: PathBuf,
    sync: StatusSync,
    manager: Arc<WorkspaceManager>,
    git: Box<dyn GitRunner>,
    base_branch: String,
    delete_merged_branches: bool,
}

impl Reconciler {
    pub fn new(
        project_root: impl Into<PathBuf>,
        sync: StatusSync,
        manager: Arc<WorkspaceManager>,
        base_branch: impl Into<String>,
        delete_merged_branches: bool,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            sync,
            manager,
            git: Box::new(RealGitRunner),
            base_branch: base_branch.into(),
            delete_merged_branches,
        }
    }

    /// Swap in a custom git runner (for testing).
    pub fn with_git_runner(mut self, git: Box<dyn GitRunner>) -> Self {
        self.git = git;
        self
    }

    /// Merge one completed task's branch into the integration line.
    ///
    /// The merge flow:
    /// 1. Gate on task state (completed, tests green, not merged)
    /// 2. Check whether the branch has any delta
    /// 3. Attempt the merge with `--no-ff --no-commit`
    /// 4. On conflict: abort, park as `pending_merge`, report the paths
    /// 5. On success: commit, mark merged, reclaim the workspace
    pub fn merge(&self, task_id: &str, allow_failing_tests: bool) -> Result<MergeOutcome> {
        let plan = self.sync.store().load()?;
        let task = plan
            .task(task_id)
            .ok_or_else(|| PlanError::UnknownTask(task_id.to_string()))?;

        if task.status != TaskStatus::Completed {
            return Err(ReconcileError::NotCompleted {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }
        if task.merge_state == MergeState::Merged {
            return Err(ReconcileError::AlreadyMerged(task_id.to_string()));
        }
        let tests_passed = task.results.as_ref().is_some_and(|r| r.tests_passed);
        if !tests_passed && !allow_failing_tests {
            return Err(ReconcileError::TestsFailing(task_id.to_string()));
        }

        let workspace = self.manager.find(task_id)?;
        let branch = workspace
            .as_ref()
            .map(|w| w.branch.clone())
            .unwrap_or_else(|| crate::git::task_branch(task_id));

        info!(task_id, branch = %branch, base = %self.base_branch, "attempting merge");

        // Integration line may have moved; best effort.
        let _ = self.git.run_git(&self.project_root, &["fetch", "origin"]);

        let diff = self.run(&["diff", "--stat", &self.base_branch, &branch])?;
        if diff.stdout.trim().is_empty() {
            info!(task_id, branch = %branch, "nothing to merge");
            self.mark_merged(task_id)?;
            if let Some(ws) = &workspace {
                self.reclaim_after_merge(ws);
            }
            return Ok(MergeOutcome::NothingToMerge);
        }

        let merge = self.run(&["merge", "--no-ff", "--no-commit", &branch])?;
        if !merge.success {
            let conflict_files = self
                .run(&["diff", "--name-only", "--diff-filter=U"])
                .map(|o| {
                    o.stdout
                        .lines()
                        .filter(|l| !l.is_empty())
                        .map(|l| l.to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let _ = self.git.run_git(&self.project_root, &["merge", "--abort"]);

            let conflicts = if conflict_files.is_empty() {
                merge
                    .stderr
                    .lines()
                    .chain(merge.stdout.lines())
                    .filter(|l| l.contains("CONFLICT"))
                    .map(|l| l.to_string())
                    .collect()
            } else {
                conflict_files
            };

            warn!(task_id, conflicts = ?conflicts, "merge conflicts detected");
            self.sync.store().apply(Mutation::SetMergeState {
                task_id: task_id.to_string(),
                state: MergeState::PendingMerge,
            })?;
            return Err(ReconcileError::MergeConflict(conflicts));
        }

        let message = format!("Merge branch '{}' into {}", branch, self.base_branch);
        let commit = self.run(&["commit", "-m", &message])?;
        if !commit.success {
            let _ = self.git.run_git(&self.project_root, &["merge", "--abort"]);
            return Err(ReconcileError::GitCommand(commit.stderr));
        }

        self.mark_merged(task_id)?;
        if let Some(ws) = &workspace {
            self.reclaim_after_merge(ws);
        }
        if self.delete_merged_branches {
            let deleted = self.run(&["branch", "-d", &branch]);
            if let Ok(out) = deleted {
                if !out.success {
                    warn!(branch = %branch, stderr = %out.stderr, "failed to delete merged branch");
                }
            }
        }

        info!(task_id, branch = %branch, "merge successful");
        Ok(MergeOutcome::Merged)
    }

    /// Merge every eligible completed task. One task's conflict or guard
    /// never aborts the others; the report carries what happened per task.
    pub fn reconcile_all(&self, allow_failing_tests: bool) -> Result<ReconcileReport> {
        let plan = self.sync.store().load()?;
        let mut report = ReconcileReport::default();

        let candidates: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed && t.merge_state != MergeState::Merged)
            .map(|t| t.id.clone())
            .collect();

        for task_id in candidates {
            match self.merge(&task_id, allow_failing_tests) {
                Ok(_) => report.merged.push(task_id),
                Err(ReconcileError::MergeConflict(files)) => {
                    report.conflicts.push((task_id, files));
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "skipping task during reconcile");
                    report.skipped.push((task_id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Pending tasks unblocked by this merge (display helper for the CLI).
    pub fn unblocked_after(&self, task_id: &str) -> Result<Vec<String>> {
        let plan = self.sync.store().load()?;
        Ok(resolver::unblocked_by(&plan, task_id)
            .into_iter()
            .map(|t| t.id.clone())
            .collect())
    }

    fn mark_merged(&self, task_id: &str) -> Result<()> {
        self.sync.store().apply(Mutation::SetMergeState {
            task_id: task_id.to_string(),
            state: MergeState::Merged,
        })?;
        Ok(())
    }

    /// Post-merge reclamation is best effort: the merge already landed, so
    /// a dirty or locked workspace is only warned about, kept for the
    /// operator to inspect.
    fn reclaim_after_merge(&self, workspace: &crate::manager::Workspace) {
        match self.manager.reclaim(workspace, false) {
            Ok(()) => {}
            Err(e) => {
                warn!(
                    task_id = %workspace.task_id,
                    path = %workspace.path,
                    error = %e,
                    "workspace left in place after merge"
                );
            }
        }
    }

    fn run(&self, args: &[&str]) -> Result<crate::git::GitOutput> {
        self.git
            .run_git(&self.project_root, args)
            .map_err(ReconcileError::GitCommand)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitOutput;
    use fm_core::plan_store::PlanStore;
    use fm_core::types::{
        OutcomeStatus, Plan, Task, TaskComplexity, TaskPriority, WorkerOutcome,
    };
    use std::path::Path;
    use std::sync::Mutex;

    struct MockGitRunner {
        responses: Mutex<Vec<GitOutput>>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl MockGitRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, _dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GitOutput::ok(""))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn outcome(tests_passed: bool) -> WorkerOutcome {
        WorkerOutcome {
            status: OutcomeStatus::Completed,
            summary: "done".into(),
            files_changed: vec!["src/lib.rs".into()],
            commits: 1,
            tests_passed,
            error: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            timed_out: false,
            duration_ms: 5,
        }
    }

    /// Plan with one completed task `task-0`, no registered workspace.
    fn setup(
        tests_passed: bool,
        git_responses: Vec<GitOutput>,
    ) -> (Reconciler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PlanStore::new(dir.path().join("plan.json")));
        let mut plan = Plan::new("test", 2);
        plan.tasks.push(Task::new(
            "task-0",
            "Demo",
            TaskPriority::Medium,
            TaskComplexity::Small,
        ));
        store.create(&plan).unwrap();

        let sync = StatusSync::new(store);
        sync.assign("task-0").unwrap();
        sync.start("task-0").unwrap();
        sync.finish("task-0", &outcome(tests_passed)).unwrap();

        let manager = Arc::new(WorkspaceManager::with_git_runner(
            dir.path(),
            dir.path().join(".workspaces"),
            "main",
            Box::new(MockGitRunner::new(vec![])),
        ));
        let reconciler = Reconciler::new(dir.path(), sync, manager, "main", true)
            .with_git_runner(Box::new(MockGitRunner::new(git_responses)));
        (reconciler, dir)
    }

    #[test]
    fn merge_succeeds_and_marks_merged() {
        let (reconciler, dir) = setup(
            true,
            vec![
                GitOutput::ok(""),                         // fetch
                GitOutput::ok("src/lib.rs | 5 ++---\n"),   // diff --stat
                GitOutput::ok(""),                         // merge --no-commit
                GitOutput::ok(""),                         // commit
                GitOutput::ok(""),                         // branch -d
            ],
        );

        let outcome = reconciler.merge("task-0", false).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);

        let store = PlanStore::new(dir.path().join("plan.json"));
        let plan = store.load().unwrap();
        assert_eq!(plan.task("task-0").unwrap().merge_state, MergeState::Merged);
    }

    #[test]
    fn merge_conflict_parks_task_as_pending_merge() {
        let (reconciler, dir) = setup(
            true,
            vec![
                GitOutput::ok(""),                        // fetch
                GitOutput::ok("src/lib.rs | 5 ++---\n"),  // diff --stat
                GitOutput::err("CONFLICT (content): Merge conflict in src/lib.rs\n"), // merge
                GitOutput::ok("src/lib.rs\n"),            // diff --name-only
                GitOutput::ok(""),                        // merge --abort
            ],
        );

        let err = reconciler.merge("task-0", false).unwrap_err();
        match err {
            ReconcileError::MergeConflict(files) => {
                assert_eq!(files, vec!["src/lib.rs".to_string()]);
            }
            other => panic!("expected MergeConflict, got {other:?}"),
        }

        let store = PlanStore::new(dir.path().join("plan.json"));
        let plan = store.load().unwrap();
        let task = plan.task("task-0").unwrap();
        // Completed but un-merged, branch preserved.
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.merge_state, MergeState::PendingMerge);
    }

    #[test]
    fn merge_refuses_failing_tests_without_override() {
        let (reconciler, _dir) = setup(false, vec![]);
        let err = reconciler.merge("task-0", false).unwrap_err();
        assert!(matches!(err, ReconcileError::TestsFailing(_)));
    }

    #[test]
    fn merge_allows_failing_tests_with_override() {
        let (reconciler, _dir) = setup(
            false,
            vec![
                GitOutput::ok(""),                        // fetch
                GitOutput::ok("src/lib.rs | 1 +\n"),      // diff --stat
                GitOutput::ok(""),                        // merge
                GitOutput::ok(""),                        // commit
                GitOutput::ok(""),                        // branch -d
            ],
        );
        assert_eq!(
            reconciler.merge("task-0", true).unwrap(),
            MergeOutcome::Merged
        );
    }

    #[test]
    fn merge_refuses_non_completed_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PlanStore::new(dir.path().join("plan.json")));
        let mut plan = Plan::new("test", 1);
        plan.tasks.push(Task::new(
            "task-0",
            "Demo",
            TaskPriority::Medium,
            TaskComplexity::Small,
        ));
        store.create(&plan).unwrap();

        let manager = Arc::new(WorkspaceManager::with_git_runner(
            dir.path(),
            dir.path().join(".workspaces"),
            "main",
            Box::new(MockGitRunner::new(vec![])),
        ));
        let reconciler = Reconciler::new(dir.path(), StatusSync::new(store), manager, "main", true)
            .with_git_runner(Box::new(MockGitRunner::new(vec![])));

        let err = reconciler.merge("task-0", false).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::NotCompleted {
                status: TaskStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn empty_delta_counts_as_merged() {
        let (reconciler, dir) = setup(
            true,
            vec![
                GitOutput::ok(""), // fetch
                GitOutput::ok(""), // diff --stat: empty
            ],
        );
        assert_eq!(
            reconciler.merge("task-0", false).unwrap(),
            MergeOutcome::NothingToMerge
        );
        let plan = PlanStore::new(dir.path().join("plan.json")).load().unwrap();
        assert_eq!(plan.task("task-0").unwrap().merge_state, MergeState::Merged);
    }

    #[test]
    fn reconcile_all_continues_past_conflicts() {
        // Two completed tasks; the first conflicts, the second merges.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PlanStore::new(dir.path().join("plan.json")));
        let mut plan = Plan::new("test", 2);
        for id in ["a", "b"] {
            plan.tasks.push(Task::new(
                id,
                format!("Task {id}"),
                TaskPriority::Medium,
                TaskComplexity::Small,
            ));
        }
        store.create(&plan).unwrap();
        let sync = StatusSync::new(store);
        for id in ["a", "b"] {
            sync.assign(id).unwrap();
            sync.start(id).unwrap();
            sync.finish(id, &outcome(true)).unwrap();
        }

        let manager = Arc::new(WorkspaceManager::with_git_runner(
            dir.path(),
            dir.path().join(".workspaces"),
            "main",
            Box::new(MockGitRunner::new(vec![])),
        ));
        let reconciler = Reconciler::new(dir.path(), sync, manager, "main", false)
            .with_git_runner(Box::new(MockGitRunner::new(vec![
                // task a
                GitOutput::ok(""),                       // fetch
                GitOutput::ok("x | 1 +\n"),              // diff --stat
                GitOutput::err("CONFLICT in x\n"),       // merge fails
                GitOutput::ok("x\n"),                    // diff --name-only
                GitOutput::ok(""),                       // merge --abort
                // task b
                GitOutput::ok(""),                       // fetch
                GitOutput::ok("y | 1 +\n"),              // diff --stat
                GitOutput::ok(""),                       // merge
                GitOutput::ok(""),                       // commit
            ])));

        let report = reconciler.reconcile_all(false).unwrap();
        assert_eq!(report.merged, vec!["b".to_string()]);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].0, "a");
        assert!(report.skipped.is_empty());
    }
}
