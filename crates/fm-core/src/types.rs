use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Valid edges:
    /// - Pending    -> Assigned     (claimed by the scheduler)
    /// - Assigned   -> InProgress   (worker launched)
    /// - Assigned   -> Pending      (dispatch failed before the worker started)
    /// - InProgress -> Completed    (terminal)
    /// - InProgress -> Blocked      (terminal, operator-resolvable)
    /// - Blocked    -> Pending      (operator retry)
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::InProgress)
                | (TaskStatus::Assigned, TaskStatus::Pending)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::Blocked, TaskStatus::Pending)
        )
    }

    /// Terminal states need operator action (or nothing at all) to leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskPriority / TaskComplexity
// ---------------------------------------------------------------------------

/// Scheduling priority. Derived ordering puts `Blocker` first, so an
/// ascending sort yields the dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Blocker = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskPriority::Blocker => "blocker",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Trivial,
    Small,
    Medium,
    Large,
    Complex,
}

// ---------------------------------------------------------------------------
// MergeState
// ---------------------------------------------------------------------------

/// Reconciliation sub-state for a completed task.
///
/// `PendingMerge` marks a task whose branch could not be merged cleanly;
/// the task stays `completed` but its work is still on its own branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    #[default]
    NotMerged,
    PendingMerge,
    Merged,
}

// ---------------------------------------------------------------------------
// TaskResults
// ---------------------------------------------------------------------------

/// Outcome record persisted on a task after a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResults {
    pub commits: u32,
    pub files_changed: Vec<String>,
    pub tests_passed: bool,
    pub summary: String,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable operator-chosen id, unique within the plan (e.g. `task-0`).
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub complexity: TaskComplexity,
    /// Paths this task is expected to touch. Advisory: overlap with a
    /// concurrently scheduled task is surfaced as a conflict warning.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    /// Path of the bound workspace, if one is allocated.
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub merge_state: MergeState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Option<TaskResults>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        priority: TaskPriority,
        complexity: TaskComplexity,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            priority,
            complexity,
            files: Vec::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            workspace: None,
            merge_state: MergeState::NotMerged,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            results: None,
        }
    }

    /// Completed with green tests and not yet merged.
    pub fn is_merge_eligible(&self) -> bool {
        self.status == TaskStatus::Completed
            && self.merge_state != MergeState::Merged
            && self.results.as_ref().is_some_and(|r| r.tests_passed)
    }
}

// ---------------------------------------------------------------------------
// WorkerOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Blocked,
    Failed,
}

/// The result of one dispatch attempt. Value type: produced once per
/// attempt, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub status: OutcomeStatus,
    pub summary: String,
    pub files_changed: Vec<String>,
    pub commits: u32,
    pub tests_passed: bool,
    pub error: Option<String>,
    /// Tail of captured process stdout, kept for diagnostics.
    pub stdout_tail: String,
    /// Tail of captured process stderr, kept for diagnostics.
    pub stderr_tail: String,
    /// The dispatch hit its hard timeout and the process was terminated.
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl WorkerOutcome {
    /// A failed outcome with no useful worker report.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            summary: String::new(),
            files_changed: Vec::new(),
            commits: 0,
            tests_passed: false,
            error: Some(error.into()),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            timed_out: false,
            duration_ms: 0,
        }
    }

    /// Project this outcome into the results record persisted on the task.
    pub fn to_results(&self) -> TaskResults {
        TaskResults {
            commits: self.commits,
            files_changed: self.files_changed.clone(),
            tests_passed: self.tests_passed,
            summary: self.summary.clone(),
            error: self.error.clone(),
        }
    }

    /// The terminal task status this outcome maps to. Anything short of a
    /// clean completion leaves the task blocked for the operator.
    pub fn terminal_status(&self) -> TaskStatus {
        match self.status {
            OutcomeStatus::Completed => TaskStatus::Completed,
            OutcomeStatus::Blocked | OutcomeStatus::Failed => TaskStatus::Blocked,
        }
    }
}

// ---------------------------------------------------------------------------
// JournalEntry
// ---------------------------------------------------------------------------

/// One audit record per applied mutation. Appended by the plan store,
/// never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub op: String,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Upper bound on concurrently dispatched workers.
    pub max_parallel: usize,
    /// Bumped on every persisted mutation.
    #[serde(default)]
    pub revision: u64,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
}

impl Plan {
    pub fn new(name: impl Into<String>, max_parallel: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            max_parallel: max_parallel.max(1),
            revision: 0,
            tasks: Vec::new(),
            journal: Vec::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// All tasks are terminal: nothing left to schedule or supervise.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Count of tasks per status, in state-machine order.
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Blocked,
        ]
        .into_iter()
        .map(|s| (s, self.tasks.iter().filter(|t| t.status == s).count()))
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(&Assigned));
        assert!(Assigned.can_transition_to(&InProgress));
        assert!(Assigned.can_transition_to(&Pending));
        assert!(InProgress.can_transition_to(&Completed));
        assert!(InProgress.can_transition_to(&Blocked));
        assert!(Blocked.can_transition_to(&Pending));

        assert!(!Pending.can_transition_to(&InProgress));
        assert!(!Pending.can_transition_to(&Completed));
        assert!(!Completed.can_transition_to(&Pending));
        assert!(!Completed.can_transition_to(&Blocked));
        assert!(!InProgress.can_transition_to(&Pending));
    }

    #[test]
    fn priority_orders_blocker_first() {
        let mut prios = vec![
            TaskPriority::Low,
            TaskPriority::Blocker,
            TaskPriority::Medium,
            TaskPriority::High,
        ];
        prios.sort();
        assert_eq!(
            prios,
            vec![
                TaskPriority::Blocker,
                TaskPriority::High,
                TaskPriority::Medium,
                TaskPriority::Low,
            ]
        );
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        let mut outcome = WorkerOutcome::failed("boom");
        assert_eq!(outcome.terminal_status(), TaskStatus::Blocked);

        outcome.status = OutcomeStatus::Completed;
        assert_eq!(outcome.terminal_status(), TaskStatus::Completed);

        outcome.status = OutcomeStatus::Blocked;
        assert_eq!(outcome.terminal_status(), TaskStatus::Blocked);
    }

    #[test]
    fn merge_eligibility_requires_green_tests() {
        let mut task = Task::new("task-0", "Test", TaskPriority::Medium, TaskComplexity::Small);
        assert!(!task.is_merge_eligible());

        task.status = TaskStatus::Completed;
        task.results = Some(TaskResults {
            commits: 1,
            files_changed: vec!["src/lib.rs".into()],
            tests_passed: false,
            summary: "done".into(),
            error: None,
        });
        assert!(!task.is_merge_eligible());

        task.results.as_mut().unwrap().tests_passed = true;
        assert!(task.is_merge_eligible());

        task.merge_state = MergeState::Merged;
        assert!(!task.is_merge_eligible());
    }

    #[test]
    fn task_serialization_roundtrip() {
        let mut task = Task::new("task-1", "Wire codec", TaskPriority::High, TaskComplexity::Medium);
        task.depends_on = vec!["task-0".into()];
        task.files = vec!["src/codec.rs".into()];

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"priority\":\"high\""));

        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "task-1");
        assert_eq!(back.depends_on, vec!["task-0".to_string()]);
    }

    #[test]
    fn plan_status_counts() {
        let mut plan = Plan::new("demo", 2);
        plan.tasks.push(Task::new("a", "A", TaskPriority::Medium, TaskComplexity::Small));
        let mut b = Task::new("b", "B", TaskPriority::Medium, TaskComplexity::Small);
        b.status = TaskStatus::Completed;
        plan.tasks.push(b);

        let counts = plan.status_counts();
        assert_eq!(counts[0], (TaskStatus::Pending, 1));
        assert_eq!(counts[3], (TaskStatus::Completed, 1));
        assert!(!plan.is_finished());
    }
}
