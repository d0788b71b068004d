//! Final report of a plan execution.

use crate::core::plan::{Plan, PlanId};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::orchestration::phase::Phase;
use crate::registry::WorkerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Overall outcome of `execute_plan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    /// Every executable task completed.
    Completed,
    /// Some tasks completed, others failed or never ran.
    Partial,
    /// Nothing completed, or the run hit an unrecoverable error.
    Error,
    /// Stopped by an external cancel.
    Cancelled,
}

impl SummaryStatus {
    pub fn classify(completed: usize, total: usize, cancelled: bool) -> Self {
        if cancelled {
            SummaryStatus::Cancelled
        } else if total > 0 && completed == total {
            SummaryStatus::Completed
        } else if completed > 0 {
            SummaryStatus::Partial
        } else {
            SummaryStatus::Error
        }
    }
}

impl std::fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryStatus::Completed => write!(f, "completed"),
            SummaryStatus::Partial => write!(f, "partial"),
            SummaryStatus::Error => write!(f, "error"),
            SummaryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-task line of the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub worker: Option<WorkerId>,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            status: task.status,
            priority: task.priority,
            worker: task.assigned_worker.clone(),
            result: task.result.clone(),
            failure_reason: task.failure_reason.clone(),
            attempts: task.attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_id: PlanId,
    pub status: SummaryStatus,
    /// Derived plan status at the end of the run.
    pub plan_status: TaskStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    /// `completed / total`, 0.0 for an empty plan.
    pub success_rate: f64,
    /// Retry passes consumed by failure handling.
    pub retries: u32,
    pub timed_out: bool,
    pub cancelled: bool,
    pub error: Option<String>,
    pub phases: Vec<Phase>,
    pub duration_ms: u64,
    /// Executable tasks in dependency order.
    pub tasks: Vec<TaskReport>,
}

impl ExecutionSummary {
    /// Summarize the leaves of `plan`, visiting them in `order`.
    pub fn from_plan(plan: &Plan, order: &[TaskId]) -> Self {
        let tasks: Vec<TaskReport> = order
            .iter()
            .filter_map(|id| plan.task(id))
            .filter(|t| t.is_leaf() && !plan.is_idle_goal_root(&t.id))
            .map(TaskReport::from)
            .collect();
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let total = tasks.len();
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);
        let pending = total - completed - failed;

        Self {
            plan_id: plan.id,
            status: SummaryStatus::classify(completed, total, false),
            plan_status: plan.status,
            total,
            completed,
            failed,
            pending,
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            retries: 0,
            timed_out: false,
            cancelled: false,
            error: None,
            phases: Vec::new(),
            duration_ms: 0,
            tasks,
        }
    }

    /// Summary for a run that never got a readable plan.
    pub fn unavailable(plan_id: PlanId, error: String) -> Self {
        Self {
            plan_id,
            status: SummaryStatus::Error,
            plan_status: TaskStatus::Pending,
            total: 0,
            completed: 0,
            failed: 0,
            pending: 0,
            success_rate: 0.0,
            retries: 0,
            timed_out: false,
            cancelled: false,
            error: Some(error),
            phases: Vec::new(),
            duration_ms: 0,
            tasks: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = crate::util::millis(duration);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == SummaryStatus::Completed
    }

    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
