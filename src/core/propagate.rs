//! Bottom-up status propagation.
//!
//! A parent's status is a pure function of its children's statuses, and the
//! plan's status is the same function applied to its root tasks, minus an
//! idle goal root. Precedence: all completed, then any failed, then any in
//! progress, else pending.

use crate::core::plan::Plan;
use crate::core::task::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// A derived status that changed during propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Everything a single `propagate` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Propagation {
    /// Ancestors whose derived status changed, nearest first.
    pub changes: Vec<StatusChange>,
    /// Plan status before and after, when it changed.
    pub plan_status: Option<(TaskStatus, TaskStatus)>,
}

impl Propagation {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.plan_status.is_none()
    }
}

/// Fold child statuses into a parent status.
///
/// An empty set derives `Pending`.
pub fn derive_status<'a, I>(children: I) -> TaskStatus
where
    I: IntoIterator<Item = &'a TaskStatus>,
{
    let mut total = 0usize;
    let mut completed = 0usize;
    let mut failed = false;
    let mut in_progress = false;

    for status in children {
        total += 1;
        match status {
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed => failed = true,
            TaskStatus::InProgress => in_progress = true,
            TaskStatus::Pending => {}
        }
    }

    if total > 0 && completed == total {
        TaskStatus::Completed
    } else if failed {
        TaskStatus::Failed
    } else if in_progress {
        TaskStatus::InProgress
    } else {
        TaskStatus::Pending
    }
}

fn derived_for(plan: &Plan, parent: &TaskId) -> Option<TaskStatus> {
    let task = plan.tasks.get(parent)?;
    if task.is_leaf() {
        return None;
    }
    let statuses: Vec<TaskStatus> = task
        .children
        .iter()
        .filter_map(|c| plan.tasks.get(c).map(|t| t.status))
        .collect();
    Some(derive_status(statuses.iter()))
}

/// Recompute the ancestors of `task_id` and the plan status.
///
/// If `task_id` itself has children it is recomputed too. Calling this
/// twice with no write in between returns an empty `Propagation` the
/// second time.
pub fn propagate(plan: &mut Plan, task_id: &TaskId) -> Propagation {
    let mut result = Propagation::default();
    let mut cursor = plan.tasks.get(task_id).map(|t| {
        if t.is_leaf() {
            t.parent_id
        } else {
            Some(t.id)
        }
    });

    while let Some(Some(current)) = cursor {
        if let Some(derived) = derived_for(plan, &current) {
            if let Some(task) = plan.tasks.get_mut(&current) {
                if task.status != derived {
                    result.changes.push(StatusChange {
                        task_id: current,
                        from: task.status,
                        to: derived,
                    });
                    task.status = derived;
                    task.touch();
                }
            }
        }
        cursor = plan.tasks.get(&current).map(|t| t.parent_id);
    }

    result.plan_status = recompute_plan_status(plan);
    result
}

/// Recompute every parent bottom-up, then the plan status.
pub fn propagate_all(plan: &mut Plan) -> Propagation {
    let mut result = Propagation::default();
    let mut order = Vec::new();
    for root in plan.root_task_ids.clone() {
        post_order(plan, root, &mut order);
    }

    for id in order {
        if let Some(derived) = derived_for(plan, &id) {
            if let Some(task) = plan.tasks.get_mut(&id) {
                if task.status != derived {
                    result.changes.push(StatusChange {
                        task_id: id,
                        from: task.status,
                        to: derived,
                    });
                    task.status = derived;
                    task.touch();
                }
            }
        }
    }

    result.plan_status = recompute_plan_status(plan);
    result
}

fn post_order(plan: &Plan, id: TaskId, out: &mut Vec<TaskId>) {
    if let Some(task) = plan.tasks.get(&id) {
        for child in &task.children {
            post_order(plan, *child, out);
        }
        out.push(id);
    }
}

fn recompute_plan_status(plan: &mut Plan) -> Option<(TaskStatus, TaskStatus)> {
    let statuses: Vec<TaskStatus> = plan
        .counted_roots()
        .filter_map(|id| plan.tasks.get(id).map(|t| t.status))
        .collect();
    let derived = derive_status(statuses.iter());
    if derived != plan.status {
        let from = plan.status;
        plan.status = derived;
        plan.touch();
        Some((from, derived))
    } else {
        None
    }
}

/// Check that every parent and the plan hold exactly their derived status.
pub fn is_consistent(plan: &Plan) -> bool {
    let parents_ok = plan
        .tasks
        .values()
        .filter(|t| !t.is_leaf())
        .all(|t| derived_for(plan, &t.id) == Some(t.status));
    let roots: Vec<TaskStatus> = plan
        .counted_roots()
        .filter_map(|id| plan.tasks.get(id).map(|t| t.status))
        .collect();
    parents_ok && derive_status(roots.iter()) == plan.status
}
