//! Durable plan document store.
//!
//! The plan is the single shared mutable resource of the orchestrator: every
//! component communicates through it rather than through each other. Writes
//! go through [`PlanStore::apply`] as small named mutations; each mutation
//! is validated, journaled, and persisted with an atomic temp-then-rename
//! write so a crash leaves either the new document or the prior one, never
//! a torn file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use crate::resolver::{self, CycleError};
use crate::types::{
    JournalEntry, MergeState, Plan, Task, TaskComplexity, TaskPriority, TaskResults, TaskStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The mutation or document would violate a plan invariant. The
    /// persisted document is unchanged.
    #[error("plan validation failed: {0}")]
    Validation(String),

    /// The dependency graph is unschedulable. Fatal for the whole plan.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Optimistic-concurrency conflict: the persisted status moved on while
    /// the caller was deciding. Re-read and retry.
    #[error("stale transition on '{task_id}': expected {expected}, found {actual}")]
    StaleTransition {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("invalid transition on '{task_id}': {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("plan not found at {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlanError>;

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Partial task update used by `Mutation::UpdateTask`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub complexity: Option<TaskComplexity>,
    pub files: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
}

/// Named write operations — the only way the persisted plan changes.
///
/// Mutations are deliberately small so concurrent writers touching
/// different tasks do not clobber each other: each one is a read-modify-
/// validate-write of a single task under the store's write lock, with
/// status changes guarded by the expected prior state.
#[derive(Debug, Clone)]
pub enum Mutation {
    SetStatus {
        task_id: String,
        expected: TaskStatus,
        to: TaskStatus,
    },
    AttachWorkspace {
        task_id: String,
        path: String,
    },
    DetachWorkspace {
        task_id: String,
    },
    /// Terminal transition plus the results record, in one durable write.
    RecordOutcome {
        task_id: String,
        expected: TaskStatus,
        to: TaskStatus,
        results: TaskResults,
    },
    SetMergeState {
        task_id: String,
        state: MergeState,
    },
    AddTask {
        task: Task,
    },
    UpdateTask {
        task_id: String,
        patch: TaskPatch,
    },
}

impl Mutation {
    /// Short operation name recorded in the journal.
    pub fn op(&self) -> &'static str {
        match self {
            Mutation::SetStatus { .. } => "set_status",
            Mutation::AttachWorkspace { .. } => "attach_workspace",
            Mutation::DetachWorkspace { .. } => "detach_workspace",
            Mutation::RecordOutcome { .. } => "record_outcome",
            Mutation::SetMergeState { .. } => "set_merge_state",
            Mutation::AddTask { .. } => "add_task",
            Mutation::UpdateTask { .. } => "update_task",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Mutation::SetStatus { task_id, .. }
            | Mutation::AttachWorkspace { task_id, .. }
            | Mutation::DetachWorkspace { task_id }
            | Mutation::RecordOutcome { task_id, .. }
            | Mutation::SetMergeState { task_id, .. }
            | Mutation::UpdateTask { task_id, .. } => task_id,
            Mutation::AddTask { task } => &task.id,
        }
    }
}

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

/// File-backed plan document with validated, journaled writes.
pub struct PlanStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process. Cross-task
    /// races that slip past the lock (other processes, stale callers) are
    /// caught by the expected-status check.
    write_lock: Mutex<()>,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist a brand-new plan. Refuses to overwrite an existing document.
    pub fn create(&self, plan: &Plan) -> Result<()> {
        if self.path.exists() {
            return Err(PlanError::Validation(format!(
                "plan already exists at {}",
                self.path.display()
            )));
        }
        validate(plan)?;
        self.write_atomic(plan)
    }

    /// Load and validate the plan. A cyclic graph fails here, before any
    /// task can be scheduled.
    pub fn load(&self) -> Result<Plan> {
        if !self.path.exists() {
            return Err(PlanError::NotFound(self.path.display().to_string()));
        }
        let text = std::fs::read_to_string(&self.path)?;
        let plan: Plan = serde_json::from_str(&text)?;
        validate(&plan)?;
        Ok(plan)
    }

    /// Validate and persist the whole document.
    pub fn save(&self, plan: &Plan) -> Result<()> {
        let _guard = self.lock();
        validate(plan)?;
        self.write_atomic(plan)
    }

    /// Apply one named mutation: load, mutate, validate, journal, persist.
    /// Returns the updated plan. On any error the document on disk is
    /// untouched.
    pub fn apply(&self, mutation: Mutation) -> Result<Plan> {
        let _guard = self.lock();

        let mut plan = {
            // load() revalidates; skip the lock it doesn't take.
            if !self.path.exists() {
                return Err(PlanError::NotFound(self.path.display().to_string()));
            }
            let text = std::fs::read_to_string(&self.path)?;
            serde_json::from_str::<Plan>(&text)?
        };

        let detail = apply_mutation(&mut plan, &mutation)?;
        plan.revision += 1;
        plan.journal.push(JournalEntry {
            seq: plan.revision,
            timestamp: Utc::now(),
            task_id: Some(mutation.task_id().to_string()),
            op: mutation.op().to_string(),
            detail: detail.clone(),
        });

        validate(&plan)?;
        self.write_atomic(&plan)?;

        debug!(
            op = mutation.op(),
            task_id = mutation.task_id(),
            revision = plan.revision,
            detail = %detail,
            "plan mutation applied"
        );
        Ok(plan)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| {
            warn!("plan store lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Write to `<plan>.tmp`, fsync, then rename over the live document.
    fn write_atomic(&self, plan: &Plan) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(plan)?;
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mutation application
// ---------------------------------------------------------------------------

fn apply_mutation(plan: &mut Plan, mutation: &Mutation) -> Result<String> {
    match mutation {
        Mutation::SetStatus {
            task_id,
            expected,
            to,
        } => {
            check_transition(plan, task_id, *expected, *to)?;
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| PlanError::UnknownTask(task_id.clone()))?;
            let from = task.status;
            task.status = *to;
            stamp_transition(task, *to);
            Ok(format!("{} -> {}", from, to))
        }

        Mutation::AttachWorkspace { task_id, path } => {
            if let Some(holder) = plan
                .tasks
                .iter()
                .find(|t| t.id != *task_id && t.workspace.as_deref() == Some(path.as_str()))
            {
                return Err(PlanError::Validation(format!(
                    "workspace '{}' is already bound to task '{}'",
                    path, holder.id
                )));
            }
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| PlanError::UnknownTask(task_id.clone()))?;
            match &task.workspace {
                Some(existing) if existing == path => {} // idempotent re-attach
                Some(existing) => {
                    return Err(PlanError::Validation(format!(
                        "task '{}' is already bound to workspace '{}'",
                        task_id, existing
                    )));
                }
                None => task.workspace = Some(path.clone()),
            }
            Ok(format!("workspace {}", path))
        }

        Mutation::DetachWorkspace { task_id } => {
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| PlanError::UnknownTask(task_id.clone()))?;
            let prior = task.workspace.take().unwrap_or_default();
            Ok(format!("detached {}", prior))
        }

        Mutation::RecordOutcome {
            task_id,
            expected,
            to,
            results,
        } => {
            check_transition(plan, task_id, *expected, *to)?;
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| PlanError::UnknownTask(task_id.clone()))?;
            let from = task.status;
            task.status = *to;
            task.results = Some(results.clone());
            stamp_transition(task, *to);
            Ok(format!(
                "{} -> {} (commits={}, tests_passed={})",
                from, to, results.commits, results.tests_passed
            ))
        }

        Mutation::SetMergeState { task_id, state } => {
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| PlanError::UnknownTask(task_id.clone()))?;
            if *state != MergeState::NotMerged && task.status != TaskStatus::Completed {
                return Err(PlanError::Validation(format!(
                    "task '{}' is {}, only completed tasks reconcile",
                    task_id, task.status
                )));
            }
            task.merge_state = *state;
            Ok(format!("merge_state {:?}", state))
        }

        Mutation::AddTask { task } => {
            if plan.task(&task.id).is_some() {
                return Err(PlanError::Validation(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            plan.tasks.push(task.clone());
            Ok(format!("added '{}'", task.title))
        }

        Mutation::UpdateTask { task_id, patch } => {
            let task = plan
                .task_mut(task_id)
                .ok_or_else(|| PlanError::UnknownTask(task_id.clone()))?;
            if let Some(title) = &patch.title {
                task.title = title.clone();
            }
            if let Some(description) = &patch.description {
                task.description = Some(description.clone());
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(complexity) = patch.complexity {
                task.complexity = complexity;
            }
            if let Some(files) = &patch.files {
                task.files = files.clone();
            }
            if let Some(deps) = &patch.depends_on {
                task.depends_on = deps.clone();
            }
            Ok("updated".to_string())
        }
    }
}

/// Expected-state check, edge validity, and the dependency gate for
/// `in_progress` — evaluated against the freshly loaded document.
fn check_transition(
    plan: &Plan,
    task_id: &str,
    expected: TaskStatus,
    to: TaskStatus,
) -> Result<()> {
    let task = plan
        .task(task_id)
        .ok_or_else(|| PlanError::UnknownTask(task_id.to_string()))?;

    if task.status != expected {
        return Err(PlanError::StaleTransition {
            task_id: task_id.to_string(),
            expected,
            actual: task.status,
        });
    }
    if !expected.can_transition_to(&to) {
        return Err(PlanError::InvalidTransition {
            task_id: task_id.to_string(),
            from: expected,
            to,
        });
    }
    if to == TaskStatus::InProgress {
        let unmet: Vec<&str> = task
            .depends_on
            .iter()
            .filter(|dep| {
                plan.task(dep)
                    .map(|d| d.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .map(String::as_str)
            .collect();
        if !unmet.is_empty() {
            return Err(PlanError::Validation(format!(
                "task '{}' cannot start: dependencies not completed: {}",
                task_id,
                unmet.join(", ")
            )));
        }
    }
    Ok(())
}

fn stamp_transition(task: &mut Task, to: TaskStatus) {
    let now = Utc::now();
    match to {
        TaskStatus::Assigned => task.assigned_at = Some(now),
        TaskStatus::InProgress => task.started_at = Some(now),
        TaskStatus::Completed => task.completed_at = Some(now),
        TaskStatus::Pending => task.assigned_at = None,
        TaskStatus::Blocked => {}
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Invariant checks run on load and before every persisted write.
fn validate(plan: &Plan) -> Result<()> {
    if plan.max_parallel == 0 {
        return Err(PlanError::Validation("max_parallel must be >= 1".into()));
    }

    let mut seen = std::collections::HashSet::new();
    for task in &plan.tasks {
        if task.id.trim().is_empty() {
            return Err(PlanError::Validation("task id must not be empty".into()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(PlanError::Validation(format!(
                "duplicate task id: {}",
                task.id
            )));
        }
    }

    for task in &plan.tasks {
        for dep in &task.depends_on {
            if plan.task(dep).is_none() {
                return Err(PlanError::Validation(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }
    }

    resolver::detect_cycles(plan)?;

    let mut bound = std::collections::HashMap::new();
    for task in &plan.tasks {
        if let Some(ws) = &task.workspace {
            if let Some(other) = bound.insert(ws.as_str(), task.id.as_str()) {
                return Err(PlanError::Validation(format!(
                    "workspace '{}' bound to both '{}' and '{}'",
                    ws, other, task.id
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
