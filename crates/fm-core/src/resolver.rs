//! Dependency resolution over a plan's task graph.
//!
//! Readiness is always computed from a fresh plan snapshot; nothing here is
//! cached between calls. Cycle detection runs at plan-load time so that a
//! cyclic graph is rejected before any task is scheduled.

use std::collections::{HashMap, HashSet};

use crate::types::{Plan, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The dependency graph contains a cycle and cannot be scheduled.
///
/// Carries the task ids on the detected cycle, in walk order, so the
/// operator can see the offending edge chain without re-running anything.
#[derive(Debug, Clone, thiserror::Error)]
#[error("dependency cycle: {}", .0.join(" -> "))]
pub struct CycleError(pub Vec<String>);

// ---------------------------------------------------------------------------
// Ready frontier
// ---------------------------------------------------------------------------

/// Tasks that may be dispatched right now: `pending` with every dependency
/// `completed` (or no dependencies at all).
///
/// Ordered by priority, then by declaration order within the plan — the
/// ordering is deterministic so scheduling is reproducible.
pub fn ready_tasks(plan: &Plan) -> Vec<&Task> {
    let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut ready: Vec<&Task> = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on.iter().all(|dep| {
                by_id
                    .get(dep.as_str())
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
        })
        .collect();

    // Stable sort: equal priorities keep declaration order.
    ready.sort_by_key(|t| t.priority);
    ready
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    InStack,
    Done,
}

/// Depth-first search with an explicit recursion stack. Fails fast with the
/// ids on the first cycle found; dependencies on unknown ids are skipped
/// here (plan validation reports those separately).
pub fn detect_cycles(plan: &Plan) -> Result<(), CycleError> {
    let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut states: HashMap<&str, VisitState> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    for task in &plan.tasks {
        if !states.contains_key(task.id.as_str()) {
            visit(task.id.as_str(), &by_id, &mut states, &mut stack)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Task>,
    states: &mut HashMap<&'a str, VisitState>,
    stack: &mut Vec<String>,
) -> Result<(), CycleError> {
    match states.get(id) {
        Some(VisitState::Done) => return Ok(()),
        Some(VisitState::InStack) => {
            // Close the loop: report from the first occurrence of `id`.
            let start = stack.iter().position(|s| s == id).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].to_vec();
            cycle.push(id.to_string());
            return Err(CycleError(cycle));
        }
        None => {}
    }

    states.insert(id, VisitState::InStack);
    stack.push(id.to_string());

    if let Some(task) = by_id.get(id) {
        for dep in &task.depends_on {
            if by_id.contains_key(dep.as_str()) {
                visit(dep.as_str(), by_id, states, stack)?;
            }
        }
    }

    stack.pop();
    states.insert(id, VisitState::Done);
    Ok(())
}

// ---------------------------------------------------------------------------
// Topological order
// ---------------------------------------------------------------------------

/// A full execution order (dependencies before dependents). Within a rank
/// the declaration order is preserved. Used by the graph and status views.
pub fn execution_order(plan: &Plan) -> Result<Vec<&str>, CycleError> {
    detect_cycles(plan)?;

    let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order: Vec<&str> = Vec::with_capacity(plan.tasks.len());

    while order.len() < plan.tasks.len() {
        let before = order.len();
        for task in &plan.tasks {
            if placed.contains(task.id.as_str()) {
                continue;
            }
            let deps_placed = task
                .depends_on
                .iter()
                .all(|d| !by_id.contains_key(d.as_str()) || placed.contains(d.as_str()));
            if deps_placed {
                placed.insert(task.id.as_str());
                order.push(task.id.as_str());
            }
        }
        if order.len() == before {
            // Unreachable after detect_cycles, kept as a hard stop.
            return Err(CycleError(
                plan.tasks
                    .iter()
                    .filter(|t| !placed.contains(t.id.as_str()))
                    .map(|t| t.id.clone())
                    .collect(),
            ));
        }
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// File conflicts (advisory)
// ---------------------------------------------------------------------------

/// Declared-file overlap between two tasks that would run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub left: String,
    pub right: String,
    pub paths: Vec<String>,
}

impl std::fmt::Display for FileConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tasks '{}' and '{}' both declare: {}",
            self.left,
            self.right,
            self.paths.join(", ")
        )
    }
}

/// Pairwise overlap report for a candidate co-scheduling set.
///
/// Advisory only: the scheduler warns and proceeds (the declared file list
/// is an estimate, not a contract).
pub fn file_conflicts(candidates: &[&Task]) -> Vec<FileConflict> {
    let mut conflicts = Vec::new();
    for (i, left) in candidates.iter().enumerate() {
        let left_files: HashSet<&str> = left.files.iter().map(String::as_str).collect();
        if left_files.is_empty() {
            continue;
        }
        for right in &candidates[i + 1..] {
            let mut shared: Vec<String> = right
                .files
                .iter()
                .filter(|p| left_files.contains(p.as_str()))
                .cloned()
                .collect();
            if !shared.is_empty() {
                shared.sort();
                conflicts.push(FileConflict {
                    left: left.id.clone(),
                    right: right.id.clone(),
                    paths: shared,
                });
            }
        }
    }
    conflicts
}

// ---------------------------------------------------------------------------
// Unblocked-by report
// ---------------------------------------------------------------------------

/// Pending tasks whose only unmet dependency is `task_id` — the tasks that
/// become ready the moment it completes. Shown by the CLI after a task
/// finishes or merges.
pub fn unblocked_by<'a>(plan: &'a Plan, task_id: &str) -> Vec<&'a Task> {
    let by_id: HashMap<&str, &Task> = plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    plan.tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.depends_on.iter().any(|d| d == task_id))
        .filter(|t| {
            t.depends_on.iter().all(|dep| {
                dep == task_id
                    || by_id
                        .get(dep.as_str())
                        .is_some_and(|d| d.status == TaskStatus::Completed)
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
