//! The orchestrating loop: ready frontier in, terminal statuses out.
//!
//! Each pass reads a fresh plan snapshot, claims ready tasks up to the
//! concurrency limit, allocates their workspaces, and fans dispatches out
//! into a `JoinSet`. Readiness is recomputed from the durable document
//! after every transition — never cached — so a task cannot start before
//! its dependencies are durably completed. Task-local failures (spawn
//! errors, timeouts, refused transitions) are settled and logged without
//! aborting sibling tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use fm_core::plan_store::{Mutation, PlanError};
use fm_core::resolver;
use fm_core::status::StatusSync;
use fm_core::types::{TaskStatus, WorkerOutcome};
use fm_workspace::manager::WorkspaceManager;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PoolError {
    /// Plan-level failure (validation, cycle, unreadable document) — fatal
    /// for the run, unlike anything task-local.
    #[error(transparent)]
    Plan(#[from] PlanError),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub blocked: usize,
    pub timeouts: usize,
    pub failed_to_start: usize,
    pub conflict_warnings: usize,
}

// ---------------------------------------------------------------------------
// DispatchPool
// ---------------------------------------------------------------------------

pub struct DispatchPool {
    sync: StatusSync,
    manager: Arc<WorkspaceManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownSignal,
    /// Overrides the plan's concurrency limit when set (CLI flag).
    max_parallel_override: Option<usize>,
}

impl DispatchPool {
    pub fn new(
        sync: StatusSync,
        manager: Arc<WorkspaceManager>,
        dispatcher: Arc<Dispatcher>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            sync,
            manager,
            dispatcher,
            shutdown,
            max_parallel_override: None,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel_override = max_parallel;
        self
    }

    /// Run the plan until no task is runnable and nothing is in flight, or
    /// until cancellation drains the in-flight set.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut in_flight: JoinSet<(String, std::result::Result<WorkerOutcome, DispatchError>)> =
            JoinSet::new();
        let mut in_flight_files: HashMap<String, Vec<String>> = HashMap::new();
        // Tasks that could not be dispatched this run; skipped so a
        // persistent launch failure cannot spin the loop.
        let mut parked: HashSet<String> = HashSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if !self.shutdown.is_shutting_down() {
                self.claim_ready(&mut in_flight, &mut in_flight_files, &mut parked, &mut summary)?;
            }

            if in_flight.is_empty() {
                // Nothing running and nothing claimable: finished, fully
                // blocked, cancelled, or everything left is parked.
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok((task_id, result))) => {
                            in_flight_files.remove(&task_id);
                            self.settle(&task_id, result, &mut summary, &mut parked);
                        }
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "dispatch task panicked");
                        }
                        None => {}
                    }
                }
                _ = shutdown_rx.recv(), if !self.shutdown.is_shutting_down() => {
                    info!("cancellation received; terminating in-flight workers");
                }
            }
        }

        info!(
            dispatched = summary.dispatched,
            completed = summary.completed,
            blocked = summary.blocked,
            timeouts = summary.timeouts,
            "dispatch run finished"
        );
        Ok(summary)
    }

    /// Fill free slots from the current ready frontier.
    fn claim_ready(
        &self,
        in_flight: &mut JoinSet<(String, std::result::Result<WorkerOutcome, DispatchError>)>,
        in_flight_files: &mut HashMap<String, Vec<String>>,
        parked: &mut HashSet<String>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let plan = self.sync.store().load()?;
        let limit = self
            .max_parallel_override
            .unwrap_or(plan.max_parallel)
            .max(1);

        for task in resolver::ready_tasks(&plan) {
            if in_flight.len() >= limit {
                break;
            }
            if parked.contains(&task.id) || in_flight_files.contains_key(&task.id) {
                continue;
            }

            // Advisory overlap check against everything currently running.
            for (other_id, other_files) in in_flight_files.iter() {
                let shared: Vec<&str> = task
                    .files
                    .iter()
                    .filter(|f| other_files.contains(f))
                    .map(String::as_str)
                    .collect();
                if !shared.is_empty() {
                    summary.conflict_warnings += 1;
                    warn!(
                        task_id = %task.id,
                        concurrent_with = %other_id,
                        files = ?shared,
                        "co-scheduling tasks with overlapping file lists"
                    );
                }
            }

            match self.sync.assign(&task.id) {
                Ok(_) => {}
                Err(PlanError::StaleTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }

            let workspace = match self.manager.allocate(task) {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "workspace allocation failed; releasing task");
                    parked.insert(task.id.clone());
                    let _ = self.sync.release(&task.id);
                    continue;
                }
            };
            if let Err(e) = self.sync.store().apply(Mutation::AttachWorkspace {
                task_id: task.id.clone(),
                path: workspace.path.clone(),
            }) {
                warn!(task_id = %task.id, error = %e, "workspace binding failed; releasing task");
                parked.insert(task.id.clone());
                let _ = self.sync.release(&task.id);
                continue;
            }
            if let Err(e) = self.manager.lock(&workspace) {
                warn!(task_id = %task.id, error = %e, "workspace lock failed; releasing task");
                parked.insert(task.id.clone());
                let _ = self.sync.release(&task.id);
                continue;
            }

            in_flight_files.insert(task.id.clone(), task.files.clone());
            summary.dispatched += 1;

            let dispatcher = self.dispatcher.clone();
            let manager = self.manager.clone();
            let task = task.clone();
            in_flight.spawn(async move {
                let result = dispatcher.dispatch(&task, &workspace).await;
                manager.unlock(&workspace);
                (task.id, result)
            });
        }
        Ok(())
    }

    /// Apply a finished dispatch to the plan. Task-local errors are logged
    /// and absorbed; they never abort the run.
    fn settle(
        &self,
        task_id: &str,
        result: std::result::Result<WorkerOutcome, DispatchError>,
        summary: &mut RunSummary,
        parked: &mut HashSet<String>,
    ) {
        match result {
            Ok(outcome) => {
                if outcome.timed_out {
                    summary.timeouts += 1;
                }
                match self.sync.finish(task_id, &outcome) {
                    Ok(_) => match outcome.terminal_status() {
                        TaskStatus::Completed => summary.completed += 1,
                        _ => summary.blocked += 1,
                    },
                    Err(e) => {
                        warn!(task_id, error = %e, "failed to record outcome");
                        parked.insert(task_id.to_string());
                    }
                }
            }
            Err(DispatchError::Spawn(e)) => {
                summary.failed_to_start += 1;
                warn!(task_id, error = %e, "worker failed to start; returning task to pending");
                parked.insert(task_id.to_string());
                if let Err(e) = self.sync.release(task_id) {
                    warn!(task_id, error = %e, "failed to release task");
                }
            }
            Err(DispatchError::Plan(e)) => {
                warn!(task_id, error = %e, "dispatch aborted by plan store");
                parked.insert(task_id.to_string());
                let _ = self.sync.release(task_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
