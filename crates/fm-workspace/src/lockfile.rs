//! Per-workspace lockfile.
//!
//! A dispatched worker owns its workspace for the duration of a run. The
//! lock is a JSON file (`.foreman-lock`) created with `O_CREAT | O_EXCL`,
//! so two dispatchers racing for the same workspace have exactly one
//! winner. A lock whose pid is no longer alive is stale and may be
//! reclaimed.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".foreman-lock";

/// Lock ownership state as observed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
    /// Lock file present but its holder is dead.
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceLock {
    pub pid: u32,
    pub task_id: String,
    pub acquired_at: String,
}

/// Result of trying to acquire a workspace lock.
pub enum AcquireResult {
    /// We created the lockfile — we own it.
    Acquired,
    /// Another live process holds the lock.
    Held(WorkspaceLock),
    /// Stale lockfile was cleaned up — retry.
    StaleRemoved,
}

impl WorkspaceLock {
    fn lock_path(workspace_dir: &Path) -> PathBuf {
        workspace_dir.join(LOCK_FILE_NAME)
    }

    /// Try to exclusively create the lockfile in `workspace_dir`.
    pub fn acquire(workspace_dir: &Path, task_id: &str) -> std::io::Result<AcquireResult> {
        let lock = WorkspaceLock {
            pid: std::process::id(),
            task_id: task_id.to_string(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        let path = Self::lock_path(workspace_dir);

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL — fails if file exists
            .open(&path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(&lock)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::read(workspace_dir) {
                    Some(existing) if existing.is_alive() => Ok(AcquireResult::Held(existing)),
                    _ => {
                        tracing::info!(dir = %workspace_dir.display(), "removing stale workspace lock");
                        Self::release(workspace_dir);
                        Ok(AcquireResult::StaleRemoved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Read the lock. Returns `None` if missing or unparseable.
    pub fn read(workspace_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(Self::lock_path(workspace_dir)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove the lockfile.
    pub fn release(workspace_dir: &Path) {
        let _ = std::fs::remove_file(Self::lock_path(workspace_dir));
    }

    /// Observed lock state for a workspace directory.
    pub fn state(workspace_dir: &Path) -> LockState {
        match Self::read(workspace_dir) {
            None => LockState::Unlocked,
            Some(lock) if lock.is_alive() => LockState::Locked,
            Some(_) => LockState::Stale,
        }
    }

    /// Check if the holder pid is still alive.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Assume alive on non-Unix (conservative — avoids accidental cleanup).
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
