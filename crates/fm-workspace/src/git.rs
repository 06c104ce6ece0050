use std::path::Path;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in the given directory and return (success, stdout, stderr).
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Sanitize a task id for use as a directory / branch name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Branch name bound to a task's workspace.
pub fn task_branch(task_id: &str) -> String {
    format!("task/{}", sanitize_name(task_id))
}

// ---------------------------------------------------------------------------
// Worktree listing
// ---------------------------------------------------------------------------

/// A worktree git knows about under the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListing {
    pub path: String,
    pub branch: String,
}

/// Worktrees registered with git under `workspace_root`. Prefers libgit2
/// when built with the `libgit2` feature, falling back to parsing
/// `git worktree list --porcelain`.
pub fn list_worktrees(
    git: &dyn GitRunner,
    project_root: &Path,
    workspace_root: &Path,
) -> Result<Vec<WorktreeListing>, String> {
    #[cfg(feature = "libgit2")]
    {
        if let Ok(results) = list_worktrees_git2(project_root, workspace_root) {
            return Ok(results);
        }
    }

    list_worktrees_shell(git, project_root, workspace_root)
}

fn list_worktrees_shell(
    git: &dyn GitRunner,
    project_root: &Path,
    workspace_root: &Path,
) -> Result<Vec<WorktreeListing>, String> {
    let output = git.run_git(project_root, &["worktree", "list", "--porcelain"])?;
    if !output.success {
        return Err(output.stderr);
    }

    let prefix = format!(
        "{}/",
        workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_path_buf())
            .display()
    );

    let mut results = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_branch: Option<String> = None;

    // Porcelain stanzas are blank-line separated; a trailing stanza may
    // lack the final blank line.
    for line in output.stdout.lines().chain(std::iter::once("")) {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(path.to_string());
            current_branch = None;
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        } else if line.is_empty() {
            if let (Some(path), Some(branch)) = (current_path.take(), current_branch.take()) {
                if path.starts_with(&prefix) || path.contains("/.workspaces/") {
                    results.push(WorktreeListing { path, branch });
                }
            }
            current_path = None;
            current_branch = None;
        }
    }

    Ok(results)
}

#[cfg(feature = "libgit2")]
fn list_worktrees_git2(
    project_root: &Path,
    workspace_root: &Path,
) -> Result<Vec<WorktreeListing>, String> {
    let repo = git2::Repository::discover(project_root).map_err(|e| e.message().to_string())?;
    let names = repo.worktrees().map_err(|e| e.message().to_string())?;

    let prefix = format!(
        "{}/",
        workspace_root
            .canonicalize()
            .unwrap_or_else(|_| workspace_root.to_path_buf())
            .display()
    );

    let mut results = Vec::new();
    for name in names.iter().flatten() {
        let wt = match repo.find_worktree(name) {
            Ok(w) => w,
            Err(_) => continue,
        };
        let path = wt.path().display().to_string();
        if !(path.starts_with(&prefix) || path.contains("/.workspaces/")) {
            continue;
        }

        let branch = git2::Repository::open(wt.path())
            .ok()
            .and_then(|r| {
                r.head()
                    .ok()
                    .and_then(|h| h.shorthand().map(|s| s.to_string()))
            })
            .unwrap_or_else(|| format!("task/{name}"));

        results.push(WorktreeListing { path, branch });
    }

    results.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_replaces_special_chars() {
        assert_eq!(sanitize_name("My Cool Task!"), "my-cool-task-");
        assert_eq!(sanitize_name("fix/bug #42"), "fix-bug--42");
        assert_eq!(sanitize_name("task-0"), "task-0");
        assert_eq!(sanitize_name("UPPER_case"), "upper_case");
    }

    #[test]
    fn task_branch_naming() {
        assert_eq!(task_branch("task-0"), "task/task-0");
        assert_eq!(task_branch("Add API"), "task/add-api");
    }

    struct CannedGit(String);

    impl GitRunner for CannedGit {
        fn run_git(&self, _dir: &Path, _args: &[&str]) -> Result<GitOutput, String> {
            Ok(GitOutput::ok(self.0.clone()))
        }
    }

    #[test]
    fn shell_listing_filters_to_workspace_root() {
        let porcelain = "\
worktree /repo
branch refs/heads/main

worktree /repo/.workspaces/task-0
branch refs/heads/task/task-0

worktree /elsewhere/scratch
branch refs/heads/scratch
";
        let git = CannedGit(porcelain.to_string());
        let results = list_worktrees_shell(
            &git,
            Path::new("/repo"),
            Path::new("/repo/.workspaces"),
        )
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/repo/.workspaces/task-0");
        assert_eq!(results[0].branch, "task/task-0");
    }
}
