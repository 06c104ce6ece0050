//! Supervised dispatch of one worker per (task, workspace).
//!
//! The dispatcher owns the dispatch-time half of the task state machine:
//! the task moves `assigned -> in_progress` only once its worker process
//! actually launched, and a launch failure leaves the dispatcher's caller
//! free to return the task to `pending`. Timeouts and cancellation always
//! terminate the process; the outcome says so instead of pretending the
//! worker finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use fm_core::plan_store::PlanError;
use fm_core::status::StatusSync;
use fm_core::types::{OutcomeStatus, Task, WorkerOutcome};
use fm_workspace::manager::Workspace;

use crate::shutdown::ShutdownSignal;
use crate::worker::{parse_report, WorkerBackend, WorkerError, WorkerExit, WorkerRequest};

/// Bytes of stdout/stderr kept on the outcome for diagnostics.
const TAIL_BYTES: usize = 4 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The worker never started; the task is still `assigned` and the
    /// caller should release it back to `pending`.
    #[error(transparent)]
    Spawn(#[from] WorkerError),

    /// The plan store refused the `in_progress` transition (stale state or
    /// dependency gate). The launched worker has been terminated.
    #[error(transparent)]
    Plan(#[from] PlanError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    backend: Arc<dyn WorkerBackend>,
    sync: StatusSync,
    timeout: Duration,
    shutdown: ShutdownSignal,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        sync: StatusSync,
        timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            backend,
            sync,
            timeout,
            shutdown,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Launch the worker for an `assigned` task and supervise it to an
    /// outcome. Blocks until the worker exits, times out, or is cancelled.
    pub async fn dispatch(&self, task: &Task, workspace: &Workspace) -> Result<WorkerOutcome> {
        let request = WorkerRequest::for_task(task, &workspace.path, &workspace.branch);
        let started = Instant::now();

        let mut handle = self.backend.launch(&request).await?;

        // Worker is running: record in_progress before anything else. If
        // the store refuses (a racing operator moved the task), the worker
        // must not keep running unsupervised.
        if let Err(e) = self.sync.start(&task.id) {
            warn!(task_id = %task.id, error = %e, "terminating worker after refused start");
            handle.terminate().await;
            return Err(e.into());
        }

        info!(task_id = %task.id, workspace = %workspace.path, "worker dispatched");

        let exit = handle.wait(self.timeout, self.shutdown.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = self.outcome_from(&task.id, exit, duration_ms);

        info!(
            task_id = %task.id,
            status = ?outcome.status,
            timed_out = outcome.timed_out,
            duration_ms,
            "worker finished"
        );
        Ok(outcome)
    }

    /// Classify a worker exit into an outcome. Malformed or missing reports
    /// are failures — never silently coerced into `completed`.
    fn outcome_from(&self, task_id: &str, exit: WorkerExit, duration_ms: u64) -> WorkerOutcome {
        let stdout_tail = tail(&exit.stdout, TAIL_BYTES);
        let stderr_tail = tail(&exit.stderr, TAIL_BYTES);

        let mut outcome = if exit.cancelled {
            WorkerOutcome::failed("dispatch cancelled before the worker finished")
        } else if exit.timed_out {
            let mut o = WorkerOutcome::failed(format!(
                "worker timed out after {}s",
                self.timeout.as_secs()
            ));
            o.timed_out = true;
            o
        } else {
            match parse_report(&exit.stdout) {
                None => {
                    warn!(task_id, exit_code = ?exit.exit_code, "worker emitted no parsable outcome");
                    WorkerOutcome::failed(format!(
                        "worker emitted no parsable outcome (exit code {:?})",
                        exit.exit_code
                    ))
                }
                Some(report) => {
                    if report.status == OutcomeStatus::Completed && exit.exit_code != Some(0) {
                        WorkerOutcome::failed(format!(
                            "worker reported completed but exited with code {:?}",
                            exit.exit_code
                        ))
                    } else {
                        WorkerOutcome {
                            status: report.status,
                            summary: report.summary,
                            files_changed: report.files_changed,
                            commits: report.commits,
                            tests_passed: report.tests_passed,
                            error: report.error,
                            stdout_tail: String::new(),
                            stderr_tail: String::new(),
                            timed_out: false,
                            duration_ms: 0,
                        }
                    }
                }
            }
        };

        outcome.stdout_tail = stdout_tail;
        outcome.stderr_tail = stderr_tail;
        outcome.duration_ms = duration_ms;
        outcome
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let start = text.len() - max_bytes;
    // Keep the tail on a char boundary.
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fm_core::plan_store::PlanStore;
    use fm_core::types::{Plan, TaskComplexity, TaskPriority, TaskStatus};
    use fm_workspace::lockfile::LockState;
    use crate::worker::WorkerHandle;

    // -- Mock backend with a canned exit --

    struct MockBackend {
        exit: std::sync::Mutex<Option<WorkerExit>>,
        fail_spawn: bool,
    }

    impl MockBackend {
        fn with_exit(exit: WorkerExit) -> Self {
            Self {
                exit: std::sync::Mutex::new(Some(exit)),
                fail_spawn: false,
            }
        }

        fn failing_spawn() -> Self {
            Self {
                exit: std::sync::Mutex::new(None),
                fail_spawn: true,
            }
        }
    }

    struct MockHandle {
        exit: Option<WorkerExit>,
        terminated: bool,
    }

    #[async_trait]
    impl WorkerHandle for MockHandle {
        async fn wait(&mut self, _timeout: Duration, _shutdown: ShutdownSignal) -> WorkerExit {
            self.exit.take().expect("wait called once")
        }

        async fn terminate(&mut self) {
            self.terminated = true;
        }
    }

    #[async_trait]
    impl WorkerBackend for MockBackend {
        async fn launch(
            &self,
            _request: &WorkerRequest,
        ) -> std::result::Result<Box<dyn WorkerHandle>, WorkerError> {
            if self.fail_spawn {
                return Err(WorkerError::Spawn("no such binary".into()));
            }
            Ok(Box::new(MockHandle {
                exit: self.exit.lock().unwrap().take(),
                terminated: false,
            }))
        }
    }

    fn exit_with_stdout(stdout: &str, code: i32) -> WorkerExit {
        WorkerExit {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
            cancelled: false,
        }
    }

    fn setup(backend: Arc<dyn WorkerBackend>) -> (Dispatcher, Task, Workspace, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PlanStore::new(dir.path().join("plan.json")));
        let task = Task::new("task-0", "Demo", TaskPriority::Medium, TaskComplexity::Small);
        let mut plan = Plan::new("test", 1);
        plan.tasks.push(task.clone());
        store.create(&plan).unwrap();

        let sync = StatusSync::new(store);
        sync.assign("task-0").unwrap();

        let workspace = Workspace {
            path: dir.path().join("ws").display().to_string(),
            branch: "task/task-0".into(),
            task_id: "task-0".into(),
            lock: LockState::Unlocked,
            created_at: chrono::Utc::now(),
        };
        let dispatcher = Dispatcher::new(
            backend,
            sync,
            Duration::from_secs(5),
            ShutdownSignal::new(),
        );
        (dispatcher, task, workspace, dir)
    }

    #[tokio::test]
    async fn dispatch_parses_completed_report() {
        let backend = Arc::new(MockBackend::with_exit(exit_with_stdout(
            "{\"status\": \"completed\", \"summary\": \"ok\", \"commits\": 3, \"tests_passed\": true}\n",
            0,
        )));
        let (dispatcher, task, workspace, dir) = setup(backend);

        let outcome = dispatcher.dispatch(&task, &workspace).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.commits, 3);
        assert!(outcome.tests_passed);

        // Worker launch moved the task to in_progress.
        let plan = PlanStore::new(dir.path().join("plan.json")).load().unwrap();
        assert_eq!(plan.task("task-0").unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn malformed_output_is_failure_not_completion() {
        let backend = Arc::new(MockBackend::with_exit(exit_with_stdout(
            "done! everything went great\n",
            0,
        )));
        let (dispatcher, task, workspace, _dir) = setup(backend);

        let outcome = dispatcher.dispatch(&task, &workspace).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("no parsable outcome"));
        assert!(outcome.stdout_tail.contains("everything went great"));
    }

    #[tokio::test]
    async fn completed_report_with_nonzero_exit_is_failure() {
        let backend = Arc::new(MockBackend::with_exit(exit_with_stdout(
            "{\"status\": \"completed\", \"tests_passed\": true}\n",
            1,
        )));
        let (dispatcher, task, workspace, _dir) = setup(backend);

        let outcome = dispatcher.dispatch(&task, &workspace).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
    }

    #[tokio::test]
    async fn timeout_exit_becomes_failed_outcome() {
        let backend = Arc::new(MockBackend::with_exit(WorkerExit {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            cancelled: false,
        }));
        let (dispatcher, task, workspace, _dir) = setup(backend);

        let outcome = dispatcher.dispatch(&task, &workspace).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.timed_out);
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_task_assigned() {
        let backend = Arc::new(MockBackend::failing_spawn());
        let (dispatcher, task, workspace, dir) = setup(backend);

        let err = dispatcher.dispatch(&task, &workspace).await.unwrap_err();
        assert!(matches!(err, DispatchError::Spawn(_)));

        // Never reached in_progress; the pool releases it back to pending.
        let plan = PlanStore::new(dir.path().join("plan.json")).load().unwrap();
        assert_eq!(plan.task("task-0").unwrap().status, TaskStatus::Assigned);
    }

    #[test]
    fn tail_keeps_last_bytes() {
        let text = "a".repeat(10_000);
        assert_eq!(tail(&text, 100).len(), 100);
        assert_eq!(tail("short", 100), "short");
    }
}
