//! Status synchronizer: the task state machine, written through the plan
//! store's mutation channel.
//!
//! Every method is one durable, journaled mutation carrying the expected
//! prior state. A caller holding a stale view gets
//! [`PlanError::StaleTransition`](crate::plan_store::PlanError) and must
//! re-read before retrying — that is how races between a slow worker and
//! an operator-driven retry are detected instead of silently lost.

use std::sync::Arc;

use tracing::info;

use crate::plan_store::{Mutation, PlanError, PlanStore, Result};
use crate::types::{Plan, TaskResults, TaskStatus, WorkerOutcome};

// ---------------------------------------------------------------------------
// StatusSync
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StatusSync {
    store: Arc<PlanStore>,
}

impl StatusSync {
    pub fn new(store: Arc<PlanStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    /// pending -> assigned: the scheduler claimed the task.
    pub fn assign(&self, task_id: &str) -> Result<Plan> {
        self.transition(task_id, TaskStatus::Pending, TaskStatus::Assigned)
    }

    /// assigned -> pending: dispatch failed before the worker started.
    pub fn release(&self, task_id: &str) -> Result<Plan> {
        self.transition(task_id, TaskStatus::Assigned, TaskStatus::Pending)
    }

    /// assigned -> in_progress: the worker process launched. Re-checks the
    /// dependency gate against the persisted plan.
    pub fn start(&self, task_id: &str) -> Result<Plan> {
        self.transition(task_id, TaskStatus::Assigned, TaskStatus::InProgress)
    }

    /// blocked -> pending: operator-resolved retry.
    pub fn retry(&self, task_id: &str) -> Result<Plan> {
        self.transition(task_id, TaskStatus::Blocked, TaskStatus::Pending)
    }

    /// in_progress -> terminal, with the outcome recorded in the same write.
    pub fn finish(&self, task_id: &str, outcome: &WorkerOutcome) -> Result<Plan> {
        let to = outcome.terminal_status();
        info!(task_id, status = %to, "recording worker outcome");
        self.store.apply(Mutation::RecordOutcome {
            task_id: task_id.to_string(),
            expected: TaskStatus::InProgress,
            to,
            results: outcome.to_results(),
        })
    }

    /// in_progress -> blocked with a bare error record (no worker report).
    pub fn block(&self, task_id: &str, error: impl Into<String>) -> Result<Plan> {
        let error = error.into();
        self.store.apply(Mutation::RecordOutcome {
            task_id: task_id.to_string(),
            expected: TaskStatus::InProgress,
            to: TaskStatus::Blocked,
            results: TaskResults {
                commits: 0,
                files_changed: Vec::new(),
                tests_passed: false,
                summary: String::new(),
                error: Some(error),
            },
        })
    }

    fn transition(&self, task_id: &str, expected: TaskStatus, to: TaskStatus) -> Result<Plan> {
        info!(task_id, from = %expected, to = %to, "status transition");
        self.store.apply(Mutation::SetStatus {
            task_id: task_id.to_string(),
            expected,
            to,
        })
    }

    /// Retry a transition once after a stale-state error, re-reading the
    /// persisted state in between. Anything else propagates unchanged.
    pub fn assign_with_retry(&self, task_id: &str) -> Result<Plan> {
        match self.assign(task_id) {
            Err(PlanError::StaleTransition { actual, .. }) if actual == TaskStatus::Pending => {
                self.assign(task_id)
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
