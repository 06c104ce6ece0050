//! Worker backend: the process-execution contract.
//!
//! A worker is launched once per (task, workspace) with the task payload as
//! JSON on stdin. On completion it must emit a structured report — the last
//! line of stdout that parses as a JSON object — and exit with a status
//! code reflecting success. The orchestrator assumes nothing else about
//! what the worker does inside its workspace.
//!
//! Backends are interchangeable behind [`WorkerBackend`], selected by
//! configuration rather than by type-switching in the orchestrator.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fm_core::config::WorkerConfig;
use fm_core::types::{OutcomeStatus, Task};

use crate::shutdown::ShutdownSignal;

/// Bound on captured stdout/stderr per stream; bytes beyond this are
/// drained and discarded so a chatty worker cannot exhaust memory.
pub const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process never started. The task can safely return to
    /// `pending` — no work happened.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Input payload written to the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: String,
    pub title: String,
    pub description: Option<String>,
    pub files: Vec<String>,
    pub workspace: String,
    pub branch: String,
}

impl WorkerRequest {
    pub fn for_task(task: &Task, workspace: &str, branch: &str) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            files: task.files.clone(),
            workspace: workspace.to_string(),
            branch: branch.to_string(),
        }
    }
}

/// Structured report the worker emits on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerReport {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commits: u32,
    #[serde(default)]
    pub tests_passed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// How a supervised worker run ended.
#[derive(Debug)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Last stdout line that parses as a report. Anything else on stdout is
/// free-form worker chatter and ignored.
pub fn parse_report(stdout: &str) -> Option<WorkerReport> {
    stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<WorkerReport>(line.trim()).ok())
}

// ---------------------------------------------------------------------------
// WorkerBackend / WorkerHandle traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start a worker for the request. Failure here means the worker never
    /// ran — the dispatcher reverts the task to `pending`.
    async fn launch(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>, WorkerError>;
}

#[async_trait]
pub trait WorkerHandle: Send {
    /// Block until the worker exits, the timeout expires, or cancellation
    /// fires. On timeout or cancellation the process is terminated before
    /// returning — a worker is never left running.
    async fn wait(&mut self, timeout: Duration, shutdown: ShutdownSignal) -> WorkerExit;

    /// Terminate the worker immediately.
    async fn terminate(&mut self);
}

// ---------------------------------------------------------------------------
// ProcessWorker — the real backend
// ---------------------------------------------------------------------------

/// Spawns the configured external command as the worker.
pub struct ProcessWorker {
    command: String,
    args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl WorkerBackend for ProcessWorker {
    async fn launch(&self, request: &WorkerRequest) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| WorkerError::Spawn(e.to_string()))?;

        debug!(
            task_id = %request.task_id,
            command = %self.command,
            workspace = %request.workspace,
            "launching worker"
        );

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .current_dir(&request.workspace)
            .env("FOREMAN_TASK_ID", &request.task_id)
            .env("FOREMAN_WORKSPACE", &request.workspace)
            .env("FOREMAN_BRANCH", &request.branch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that exits without reading its stdin is its own
            // problem; the broken pipe is not ours to report.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "worker stdin write failed");
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_limited(stdout, OUTPUT_LIMIT_BYTES));
        let stderr_task = tokio::spawn(read_limited(stderr, OUTPUT_LIMIT_BYTES));

        Ok(Box::new(ProcessHandle {
            child,
            stdout_task,
            stderr_task,
        }))
    }
}

struct ProcessHandle {
    child: tokio::process::Child,
    stdout_task: JoinHandle<(Vec<u8>, usize)>,
    stderr_task: JoinHandle<(Vec<u8>, usize)>,
}

impl ProcessHandle {
    async fn kill(&mut self) -> Option<std::process::ExitStatus> {
        let _ = self.child.start_kill();
        self.child.wait().await.ok()
    }
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn wait(&mut self, timeout: Duration, shutdown: ShutdownSignal) -> WorkerExit {
        let mut rx = shutdown.subscribe();
        let mut timed_out = false;
        let mut cancelled = false;

        // The broadcast only reaches subscribers that existed at trigger
        // time; a late subscriber must poll the flag.
        let status = if shutdown.is_shutting_down() {
            cancelled = true;
            self.kill().await
        } else {
            tokio::select! {
                status = self.child.wait() => status.ok(),
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_secs = timeout.as_secs(), "worker timed out, killing");
                    timed_out = true;
                    self.kill().await
                }
                _ = rx.recv() => {
                    warn!("worker cancelled, killing");
                    cancelled = true;
                    self.kill().await
                }
            }
        };

        // Pipes close once the process is gone; the readers drain and stop.
        let (stdout, stdout_truncated) = (&mut self.stdout_task).await.ok().unwrap_or_default();
        let (stderr, stderr_truncated) = (&mut self.stderr_task).await.ok().unwrap_or_default();
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "worker output truncated");
        }

        WorkerExit {
            exit_code: status.and_then(|s| s.code()),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            timed_out,
            cancelled,
        }
    }

    async fn terminate(&mut self) {
        let _ = self.kill().await;
    }
}

/// Read a stream to completion, keeping at most `limit` bytes and counting
/// the rest as truncated. The pipe is always drained.
async fn read_limited<R>(reader: Option<R>, limit: usize) -> (Vec<u8>, usize)
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), 0);
    };
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let remaining = limit.saturating_sub(buf.len());
                if remaining > 0 {
                    let keep = n.min(remaining);
                    buf.extend_from_slice(&chunk[..keep]);
                    truncated += n - keep;
                } else {
                    truncated += n;
                }
            }
        }
    }
    (buf, truncated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_report_takes_last_json_line() {
        let stdout = r#"
working on it...
{"note": "not a report"}
{"status": "completed", "summary": "did the thing", "commits": 2, "tests_passed": true}
"#;
        let report = parse_report(stdout).expect("report");
        assert_eq!(report.status, OutcomeStatus::Completed);
        assert_eq!(report.summary, "did the thing");
        assert_eq!(report.commits, 2);
        assert!(report.tests_passed);
    }

    #[test]
    fn parse_report_rejects_chatter() {
        assert!(parse_report("all done, no structured output\n").is_none());
        assert!(parse_report("{\"note\": \"missing status field\"}\n").is_none());
        assert!(parse_report("").is_none());
    }

    #[test]
    fn parse_report_defaults_optional_fields() {
        let report = parse_report("{\"status\": \"blocked\"}\n").expect("report");
        assert_eq!(report.status, OutcomeStatus::Blocked);
        assert_eq!(report.commits, 0);
        assert!(!report.tests_passed);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn process_worker_captures_report() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessWorker::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo 'chatter'; echo '{"status": "completed", "summary": "ok", "tests_passed": true}'"#.into(),
            ],
        );
        let request = WorkerRequest {
            task_id: "task-0".into(),
            title: "Demo".into(),
            description: None,
            files: vec![],
            workspace: dir.path().display().to_string(),
            branch: "task/task-0".into(),
        };

        let mut handle = backend.launch(&request).await.unwrap();
        let exit = handle
            .wait(Duration::from_secs(10), ShutdownSignal::new())
            .await;

        assert_eq!(exit.exit_code, Some(0));
        assert!(!exit.timed_out);
        let report = parse_report(&exit.stdout).expect("report");
        assert_eq!(report.status, OutcomeStatus::Completed);
    }

    #[tokio::test]
    async fn process_worker_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessWorker::new("sleep", vec!["30".into()]);
        let request = WorkerRequest {
            task_id: "task-0".into(),
            title: "Slow".into(),
            description: None,
            files: vec![],
            workspace: dir.path().display().to_string(),
            branch: "task/task-0".into(),
        };

        let started = std::time::Instant::now();
        let mut handle = backend.launch(&request).await.unwrap();
        let exit = handle
            .wait(Duration::from_millis(200), ShutdownSignal::new())
            .await;

        assert!(exit.timed_out);
        assert!(!exit.cancelled);
        // Timeout plus a small grace bound, nowhere near the 30s sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn process_worker_cancellation_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessWorker::new("sleep", vec!["30".into()]);
        let request = WorkerRequest {
            task_id: "task-0".into(),
            title: "Slow".into(),
            description: None,
            files: vec![],
            workspace: dir.path().display().to_string(),
            branch: "task/task-0".into(),
        };

        let shutdown = ShutdownSignal::new();
        let mut handle = backend.launch(&request).await.unwrap();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let exit = handle.wait(Duration::from_secs(30), shutdown).await;
        assert!(exit.cancelled);
        assert!(!exit.timed_out);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let backend = ProcessWorker::new("definitely-not-a-real-binary-xyz", vec![]);
        let request = WorkerRequest {
            task_id: "task-0".into(),
            title: "Nope".into(),
            description: None,
            files: vec![],
            workspace: ".".into(),
            branch: "task/task-0".into(),
        };
        let err = backend.launch(&request).await.err().expect("spawn error");
        assert!(matches!(err, WorkerError::Spawn(_)));
    }
}
