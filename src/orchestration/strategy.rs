//! Execution strategies.
//!
//! Every strategy takes a list of assigned leaf tasks and drives each one
//! through [`TaskRunner::run_one`], which owns the status writes: the task
//! is marked `in_progress` before the worker is called and `completed` or
//! `failed` once it returns. A strategy call never returns while one of its
//! tasks is still `in_progress`.

use crate::core::plan::{PlanContext, PlanId};
use crate::core::store::{TaskStore, TaskUpdate};
use crate::core::task::{TaskId, TaskStatus};
use crate::error::Error;
use crate::registry::WorkerId;
use crate::worker::SharedWorker;
use crate::{clog_debug, clog_warn};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Which strategy dispatches a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Parallel,
    PrioritySplit,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Sequential => write!(f, "sequential"),
            StrategyKind::Parallel => write!(f, "parallel"),
            StrategyKind::PrioritySplit => write!(f, "priority_split"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(StrategyKind::Sequential),
            "parallel" => Ok(StrategyKind::Parallel),
            "priority_split" | "priority" => Ok(StrategyKind::PrioritySplit),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// Strategy selection plus its tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub kind: StrategyKind,
    /// Concurrency bound for parallel runs; `None` means the task count.
    pub parallel_limit: Option<usize>,
    /// Priority at or above which priority-split runs a task in parallel.
    pub priority_threshold: i32,
    /// Stop a sequential run at the first failure.
    pub abort_on_failure: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Sequential,
            parallel_limit: None,
            priority_threshold: 5,
            abort_on_failure: false,
        }
    }
}

/// What happened to one task during a strategy run.
///
/// `status` is `Pending` when the task was not started: a dependency was
/// not completed yet, the run was cancelled or aborted, or no worker was
/// available.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub worker: Option<WorkerId>,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
}

impl TaskOutcome {
    fn not_started(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            worker: None,
            result: None,
            failure_reason: None,
        }
    }

    pub fn started(&self) -> bool {
        self.status != TaskStatus::Pending
    }

    pub fn is_failure(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Runs single tasks of one plan against the worker set.
#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<TaskStore>,
    plan_id: PlanId,
    workers: Arc<HashMap<WorkerId, SharedWorker>>,
    context: PlanContext,
    cancel: CancellationToken,
    cancel_reason: Arc<OnceLock<String>>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<TaskStore>,
        plan_id: PlanId,
        workers: Arc<HashMap<WorkerId, SharedWorker>>,
        context: PlanContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            plan_id,
            workers,
            context,
            cancel,
            cancel_reason: Arc::new(OnceLock::new()),
        }
    }

    /// Failure reason recorded for tasks interrupted by the cancel token.
    /// Falls back to `cancelled` while unset.
    pub fn with_cancel_reason(mut self, reason: Arc<OnceLock<String>>) -> Self {
        self.cancel_reason = reason;
        self
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Execute one task if it is still ready.
    ///
    /// Readiness is re-checked under the plan lock right before the task is
    /// started, so a task whose dependency failed or has not finished yet
    /// stays `pending`.
    pub async fn run_one(&self, task_id: TaskId) -> TaskOutcome {
        if self.cancel.is_cancelled() {
            return TaskOutcome::not_started(task_id);
        }

        let snapshot = self.store.read_plan(&self.plan_id, |plan| {
            plan.task(&task_id).map(|t| {
                (
                    plan.is_ready(&task_id) && t.is_leaf() && !plan.is_idle_goal_root(&task_id),
                    t.description.clone(),
                    t.assigned_worker.clone(),
                )
            })
        });
        let (ready, description, assigned) = match snapshot {
            Ok(Some(found)) => found,
            Ok(None) | Err(_) => return TaskOutcome::not_started(task_id),
        };
        if !ready {
            clog_debug!("Runner: task {} not ready, leaving pending", task_id.short());
            return TaskOutcome::not_started(task_id);
        }
        let Some((worker_id, worker)) = assigned
            .and_then(|id| self.workers.get(&id).map(|w| (id, Arc::clone(w))))
        else {
            clog_warn!("Runner: task {} has no runnable worker, leaving pending", task_id.short());
            return TaskOutcome::not_started(task_id);
        };

        if let Err(e) = self.store.update_task_status(
            &self.plan_id,
            &task_id,
            TaskUpdate::started(Some(worker_id.clone())),
        ) {
            clog_debug!("Runner: task {} could not start: {}", task_id.short(), e);
            return TaskOutcome::not_started(task_id);
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = worker.execute(&description, &self.context) => result,
        };

        let update = match outcome {
            Ok(value) => TaskUpdate::completed(value),
            Err(Error::ExecutionFailure { reason, .. }) => TaskUpdate::failed(reason),
            Err(Error::Cancelled) => {
                TaskUpdate::failed(self.cancel_reason.get().map_or("cancelled", String::as_str))
            }
            Err(e) => TaskUpdate::failed(e.to_string()),
        };

        if let Err(e) = self.store.update_task_status(&self.plan_id, &task_id, update) {
            // Timeout and cancellation fail the task from the outside first.
            clog_debug!("Runner: late result for task {} dropped: {}", task_id.short(), e);
        }

        match self.store.get_task(&self.plan_id, &task_id) {
            Ok(task) => TaskOutcome {
                task_id,
                status: task.status,
                worker: Some(worker_id),
                result: task.result,
                failure_reason: task.failure_reason,
            },
            Err(_) => TaskOutcome {
                worker: Some(worker_id),
                failure_reason: Some("plan removed".to_string()),
                status: TaskStatus::Failed,
                ..TaskOutcome::not_started(task_id)
            },
        }
    }
}

/// Run `tasks` with the configured strategy. Outcomes follow input order.
pub async fn run(
    strategy: &Strategy,
    runner: &TaskRunner,
    tasks: &[TaskId],
    priorities: &HashMap<TaskId, i32>,
) -> Vec<TaskOutcome> {
    match strategy.kind {
        StrategyKind::Sequential => run_sequential(runner, tasks, strategy.abort_on_failure).await,
        StrategyKind::Parallel => run_parallel(runner, tasks, strategy.parallel_limit).await,
        StrategyKind::PrioritySplit => {
            run_priority_split(runner, tasks, priorities, strategy).await
        }
    }
}

/// One task at a time, in input order.
///
/// A failure does not stop the run unless `abort_on_failure` is set; the
/// remaining tasks are then returned as not started.
pub async fn run_sequential(
    runner: &TaskRunner,
    tasks: &[TaskId],
    abort_on_failure: bool,
) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::with_capacity(tasks.len());
    let mut aborted = false;
    for id in tasks {
        if aborted {
            outcomes.push(TaskOutcome::not_started(*id));
            continue;
        }
        let outcome = runner.run_one(*id).await;
        if outcome.is_failure() && abort_on_failure {
            clog_debug!("Sequential: aborting after failure of {}", id.short());
            aborted = true;
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// All tasks concurrently, at most `limit` at a time.
///
/// Failures are independent; the call returns once every task has
/// finished or been skipped.
pub async fn run_parallel(
    runner: &TaskRunner,
    tasks: &[TaskId],
    limit: Option<usize>,
) -> Vec<TaskOutcome> {
    if tasks.is_empty() {
        return Vec::new();
    }
    let limit = limit.unwrap_or(tasks.len()).clamp(1, tasks.len());
    let sem = Arc::new(Semaphore::new(limit));
    let mut futs: FuturesUnordered<_> = FuturesUnordered::new();

    for (position, id) in tasks.iter().enumerate() {
        let sem = sem.clone();
        let runner = runner.clone();
        let id = *id;
        futs.push(async move {
            let outcome = match sem.acquire_owned().await {
                Ok(_permit) => runner.run_one(id).await,
                Err(_) => TaskOutcome::not_started(id),
            };
            (position, outcome)
        });
    }

    let mut slots: Vec<Option<TaskOutcome>> = vec![None; tasks.len()];
    while let Some((position, outcome)) = futs.next().await {
        slots[position] = Some(outcome);
    }
    slots.into_iter().flatten().collect()
}

/// Tasks at or above the threshold run in parallel while the rest run
/// sequentially alongside them. Outcomes are reassembled in input order.
pub async fn run_priority_split(
    runner: &TaskRunner,
    tasks: &[TaskId],
    priorities: &HashMap<TaskId, i32>,
    strategy: &Strategy,
) -> Vec<TaskOutcome> {
    let (high, low): (Vec<TaskId>, Vec<TaskId>) = tasks
        .iter()
        .partition(|id| priorities.get(id).copied().unwrap_or(0) >= strategy.priority_threshold);
    clog_debug!(
        "PrioritySplit: {} parallel, {} sequential (threshold {})",
        high.len(),
        low.len(),
        strategy.priority_threshold
    );

    let (high_out, low_out) = futures::join!(
        run_parallel(runner, &high, strategy.parallel_limit),
        run_sequential(runner, &low, strategy.abort_on_failure),
    );

    let mut by_id: HashMap<TaskId, TaskOutcome> = high_out
        .into_iter()
        .chain(low_out)
        .map(|o| (o.task_id, o))
        .collect();
    tasks.iter().filter_map(|id| by_id.remove(id)).collect()
}
