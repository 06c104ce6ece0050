use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

/// Worker backend selection and supervision limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command launched once per dispatched task.
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard per-dispatch timeout; on expiry the process is terminated.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_worker_command() -> String {
    "worker".to_string()
}

fn default_timeout_secs() -> u64 {
    900
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Integration-line settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Delete a task branch after its merge lands.
    #[serde(default = "default_true")]
    pub delete_merged_branches: bool,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            delete_merged_branches: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_plan_path")]
    pub plan: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

fn default_plan_path() -> String {
    ".foreman/plan.json".to_string()
}

fn default_workspace_root() -> String {
    ".workspaces".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            plan: default_plan_path(),
            workspace_root: default_workspace_root(),
        }
    }
}

// ---------------------------------------------------------------------------
// ForemanConfig
// ---------------------------------------------------------------------------

/// Project configuration loaded from `foreman.toml` at the project root,
/// falling back to defaults when the file does not exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl ForemanConfig {
    /// Load `foreman.toml` from the given project root, or defaults.
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = project_root.as_ref().join("foreman.toml");
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Self::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific file.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: ForemanConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic checks not expressible through types alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.command must not be empty".into()));
        }
        if self.worker.timeout_secs == 0 {
            return Err(ConfigError::Invalid("worker.timeout_secs must be >= 1".into()));
        }
        if self.git.base_branch.trim().is_empty() {
            return Err(ConfigError::Invalid("git.base_branch must not be empty".into()));
        }
        Ok(())
    }

    pub fn plan_path(&self, project_root: impl AsRef<Path>) -> PathBuf {
        project_root.as_ref().join(&self.paths.plan)
    }

    pub fn workspace_root(&self, project_root: impl AsRef<Path>) -> PathBuf {
        project_root.as_ref().join(&self.paths.workspace_root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ForemanConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.worker.timeout_secs, 900);
        assert_eq!(cfg.git.base_branch, "main");
        assert_eq!(cfg.paths.plan, ".foreman/plan.json");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ForemanConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.worker.command, "worker");
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("foreman.toml"),
            r#"
[worker]
command = "claude"
args = ["-p"]

[git]
base_branch = "trunk"
"#,
        )
        .unwrap();

        let cfg = ForemanConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.worker.command, "claude");
        assert_eq!(cfg.worker.args, vec!["-p".to_string()]);
        assert_eq!(cfg.worker.timeout_secs, 900);
        assert_eq!(cfg.git.base_branch, "trunk");
        assert!(cfg.git.delete_merged_branches);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("foreman.toml"),
            "[worker]\ntimeout_secs = 0\n",
        )
        .unwrap();
        let err = ForemanConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
