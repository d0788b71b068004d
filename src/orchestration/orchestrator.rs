//! Orchestrator state machine.
//!
//! One [`PlanRun`] drives one plan through
//! `planning -> delegation -> execution -> monitoring`, then either
//! `completion` or `failure_handling`, which loops back to `delegation`
//! until retries run out. Execution is fire-and-forget: the strategy runs
//! on a spawned task while monitoring polls the store, enforces the
//! timeout, and watches for cancellation.

use crate::config::ExecutionConfig;
use crate::core::plan::{PlanContext, PlanId};
use crate::core::store::{TaskStore, TaskUpdate};
use crate::core::task::{Task, TaskDraft, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::orchestration::assign::{AssignmentResolver, CapabilityMatch};
use crate::orchestration::phase::{Phase, PhaseController};
use crate::orchestration::strategy::{self, Strategy, StrategyKind, TaskOutcome, TaskRunner};
use crate::orchestration::summary::{ExecutionSummary, SummaryStatus, TaskReport};
use crate::registry::{CapabilityRegistry, WorkerDescriptor, WorkerId};
use crate::util;
use crate::worker::{SharedPlanner, SharedWorker};
use crate::{clog, clog_debug, clog_error, clog_warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Options for one `execute_plan` or `execute_task_directly` call.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub strategy: Strategy,
    /// Overall bound, checked while monitoring.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Pause between failure handling and the next delegation; never zero.
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub capability_match: CapabilityMatch,
    pub max_subtasks: usize,
    pub max_depth: usize,
    /// Overlaid on the plan's own context before workers see it.
    pub context: PlanContext,
    /// Tasks supplied directly; skips the planner when set.
    pub tasks: Option<Vec<TaskDraft>>,
    /// Tried first for every task that has no usable assignment.
    pub preferred_worker: Option<WorkerId>,
    /// External cancellation in addition to [`Orchestrator::cancel`].
    pub cancel: Option<CancellationToken>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl ExecutionOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            strategy: Strategy {
                kind: config.strategy,
                parallel_limit: config.parallel_limit,
                priority_threshold: config.priority_threshold,
                abort_on_failure: config.abort_on_failure,
            },
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms.max(1)),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            capability_match: config.capability_match,
            max_subtasks: config.max_subtasks,
            max_depth: config.max_depth,
            context: PlanContext::new(),
            tasks: None,
            preferred_worker: None,
            cancel: None,
        }
    }

    pub fn with_strategy(mut self, kind: StrategyKind) -> Self {
        self.strategy.kind = kind;
        self
    }

    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.strategy.parallel_limit = Some(limit.max(1));
        self
    }

    pub fn with_priority_threshold(mut self, threshold: i32) -> Self {
        self.strategy.priority_threshold = threshold;
        self
    }

    pub fn with_abort_on_failure(mut self, abort: bool) -> Self {
        self.strategy.abort_on_failure = abort;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay.max(Duration::from_millis(1));
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_capability_match(mut self, mode: CapabilityMatch) -> Self {
        self.capability_match = mode;
        self
    }

    pub fn with_context(mut self, context: PlanContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskDraft>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_preferred_worker(mut self, worker: WorkerId) -> Self {
        self.preferred_worker = Some(worker);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

type WorkerMap = HashMap<WorkerId, SharedWorker>;

/// Entry point for plan execution.
///
/// Built from an explicit store, registry, worker set and optional planner;
/// nothing here is global.
pub struct Orchestrator {
    store: Arc<TaskStore>,
    registry: Arc<CapabilityRegistry>,
    workers: RwLock<WorkerMap>,
    planner: Option<SharedPlanner>,
    running: Mutex<HashMap<PlanId, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(store: Arc<TaskStore>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            store,
            registry,
            workers: RwLock::new(HashMap::new()),
            planner: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_planner(mut self, planner: SharedPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_workers<I>(self, workers: I) -> Self
    where
        I: IntoIterator<Item = SharedWorker>,
    {
        for worker in workers {
            self.add_worker(worker);
        }
        self
    }

    /// Make a worker executable and register its capabilities.
    pub fn add_worker(&self, worker: SharedWorker) {
        let id = worker.id();
        self.registry
            .register_with_priority(id.clone(), worker.capabilities(), worker.priority());
        util::write(&self.workers).insert(id, worker);
    }

    pub fn remove_worker(&self, id: &WorkerId) -> bool {
        self.registry.unregister(id);
        util::write(&self.workers).remove(id).is_some()
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.store.events()
    }

    pub fn is_running(&self, plan_id: &PlanId) -> bool {
        util::lock(&self.running).contains_key(plan_id)
    }

    /// Cancel a running execution. Returns whether one was running.
    pub fn cancel(&self, plan_id: &PlanId) -> bool {
        match util::lock(&self.running).get(plan_id) {
            Some(token) => {
                clog!("Plan {}: cancel requested", plan_id.short());
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn worker_snapshot(&self) -> Arc<WorkerMap> {
        Arc::new(util::read(&self.workers).clone())
    }

    /// Registered, executable workers in registration order.
    fn available(&self, workers: &WorkerMap) -> Vec<WorkerDescriptor> {
        self.registry
            .list_workers()
            .into_iter()
            .filter(|w| workers.contains_key(&w.id))
            .collect()
    }

    /// Run a plan to completion.
    ///
    /// Fails only when the plan does not exist or is already executing.
    /// Task failures, timeouts and exhausted retries are reported in the
    /// returned summary.
    pub async fn execute_plan(
        &self,
        plan_id: PlanId,
        options: ExecutionOptions,
    ) -> Result<ExecutionSummary> {
        let plan = self.store.get_plan(&plan_id)?;
        let cancel = options.cancel.clone().unwrap_or_default();
        let _running = RunningGuard::register(&self.running, plan_id, cancel.clone())?;

        clog!(
            "Plan {}: execute strategy={} timeout={:?} max_retries={}",
            plan_id.short(),
            options.strategy.kind,
            options.timeout,
            options.max_retries
        );
        let context = plan.context.merged(&options.context);
        let run = PlanRun::new(self, plan_id, options, context, cancel);
        Ok(run.drive().await)
    }

    /// Run one leaf outside the state machine.
    ///
    /// A failed task is reset first. Fails with `NoEligibleWorker` when no
    /// worker qualifies and with `Validation` when the task is running,
    /// already completed, or has unfinished dependencies.
    pub async fn execute_task_directly(
        &self,
        plan_id: PlanId,
        task_id: TaskId,
        options: ExecutionOptions,
    ) -> Result<TaskReport> {
        let (task, context) = self.store.read_plan(&plan_id, |plan| {
            (plan.task(&task_id).cloned(), plan.context.merged(&options.context))
        })?;
        let task = task.ok_or_else(|| Error::task_not_found(task_id))?;
        if !task.is_leaf() {
            return Err(Error::DerivedStatus {
                task: task_id.to_string(),
            });
        }
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Failed => {
                self.store.reset_task(&plan_id, &task_id)?;
            }
            status => {
                return Err(Error::Validation(format!(
                    "task {} is {} and cannot be run directly",
                    task.name, status
                )));
            }
        }
        if !self.store.read_plan(&plan_id, |plan| plan.is_ready(&task_id))? {
            return Err(Error::Validation(format!(
                "dependencies of task {} are not completed",
                task.name
            )));
        }

        let workers = self.worker_snapshot();
        let resolver = AssignmentResolver::new(options.capability_match);
        let preferred = options
            .preferred_worker
            .as_ref()
            .or(task.assigned_worker.as_ref());
        let worker = resolver
            .resolve(&task, &self.available(&workers), preferred)
            .ok_or_else(|| Error::NoEligibleWorker {
                task: task.name.clone(),
            })?;
        self.store.assign(&plan_id, &task_id, worker.clone())?;
        clog!("Plan {}: direct run of {} on {}", plan_id.short(), task.name, worker);

        let token = options.cancel.clone().unwrap_or_default().child_token();
        let runner = TaskRunner::new(
            Arc::clone(&self.store),
            plan_id,
            workers,
            context,
            token.clone(),
        );
        if tokio::time::timeout(options.timeout, runner.run_one(task_id))
            .await
            .is_err()
        {
            token.cancel();
            clog_warn!("Plan {}: direct run of {} timed out", plan_id.short(), task.name);
            if let Err(e) = self
                .store
                .update_task_status(&plan_id, &task_id, TaskUpdate::failed("timeout"))
            {
                clog_debug!("Plan {}: timeout write skipped: {}", plan_id.short(), e);
            }
        }

        let task = self.store.get_task(&plan_id, &task_id)?;
        Ok(TaskReport::from(&task))
    }
}

/// Keeps a plan in the running table for the lifetime of one execution.
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<PlanId, CancellationToken>>,
    plan_id: PlanId,
}

impl<'a> RunningGuard<'a> {
    fn register(
        running: &'a Mutex<HashMap<PlanId, CancellationToken>>,
        plan_id: PlanId,
        token: CancellationToken,
    ) -> Result<Self> {
        let mut table = util::lock(running);
        if table.contains_key(&plan_id) {
            return Err(Error::Validation(format!(
                "plan {} is already executing",
                plan_id
            )));
        }
        table.insert(plan_id, token);
        Ok(Self { running, plan_id })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        util::lock(self.running).remove(&self.plan_id);
    }
}

/// Turn drafts into a task batch under `parent`.
///
/// At most `max_subtasks` drafts are kept per level and nesting stops at
/// `max_depth`. Dependency names resolve across the whole batch, the first
/// draft of a duplicated name wins, and unknown or self references are
/// dropped with a warning. Subtasks inherit their parent draft's
/// dependencies.
pub fn tasks_from_drafts(
    drafts: &[TaskDraft],
    parent: TaskId,
    max_subtasks: usize,
    max_depth: usize,
) -> Vec<Task> {
    DraftBatch::build(drafts, parent, max_subtasks, max_depth)
}

struct DraftBatch {
    tasks: Vec<Task>,
    dependencies: Vec<Vec<String>>,
    by_name: HashMap<String, TaskId>,
    max_subtasks: usize,
    max_depth: usize,
}

impl DraftBatch {
    fn build(
        drafts: &[TaskDraft],
        root: TaskId,
        max_subtasks: usize,
        max_depth: usize,
    ) -> Vec<Task> {
        let mut batch = Self {
            tasks: Vec::new(),
            dependencies: Vec::new(),
            by_name: HashMap::new(),
            max_subtasks: max_subtasks.max(1),
            max_depth: max_depth.max(1),
        };
        batch.visit(drafts, root, 1, &[]);
        batch.resolve()
    }

    fn visit(&mut self, drafts: &[TaskDraft], parent: TaskId, depth: usize, inherited: &[String]) {
        if drafts.len() > self.max_subtasks {
            clog_warn!(
                "Planning: keeping {} of {} drafts",
                self.max_subtasks,
                drafts.len()
            );
        }
        for draft in drafts.iter().take(self.max_subtasks) {
            let name = draft.name.trim();
            if name.is_empty() {
                clog_warn!("Planning: skipping draft without a name");
                continue;
            }
            let task = Task::new(name, draft.effective_description())
                .with_priority(draft.estimated_priority)
                .with_capabilities(
                    draft
                        .required_capabilities
                        .iter()
                        .map(|c| c.trim())
                        .filter(|c| !c.is_empty()),
                )
                .with_parent(parent);
            let id = task.id;
            if self.by_name.contains_key(name) {
                clog_warn!(
                    "Planning: duplicate draft name {:?}; dependencies resolve to the first",
                    name
                );
            } else {
                self.by_name.insert(name.to_string(), id);
            }
            let mut dependencies = draft.dependencies.clone();
            dependencies.extend(inherited.iter().cloned());
            self.tasks.push(task);
            self.dependencies.push(dependencies.clone());

            if !draft.subtasks.is_empty() {
                if depth < self.max_depth {
                    self.visit(&draft.subtasks, id, depth + 1, &dependencies);
                } else {
                    clog_warn!(
                        "Planning: dropping subtasks of {:?} beyond depth {}",
                        name,
                        self.max_depth
                    );
                }
            }
        }
    }

    fn resolve(self) -> Vec<Task> {
        let by_name = self.by_name;
        self.tasks
            .into_iter()
            .zip(self.dependencies)
            .map(|(mut task, names)| {
                for name in names {
                    match by_name.get(name.trim()) {
                        Some(dep) if *dep != task.id => {
                            task.dependencies.insert(*dep);
                        }
                        Some(_) => clog_warn!("Planning: {} depends on itself; dropped", task.name),
                        None => clog_warn!(
                            "Planning: {} depends on unknown {:?}; dropped",
                            task.name,
                            name
                        ),
                    }
                }
                task
            })
            .collect()
    }
}

/// State of one `execute_plan` call.
struct PlanRun<'a> {
    orchestrator: &'a Orchestrator,
    plan_id: PlanId,
    options: ExecutionOptions,
    context: PlanContext,
    resolver: AssignmentResolver,
    phases: PhaseController,
    cancel: CancellationToken,
    started: Instant,
    retries: u32,
    exhausted: bool,
    timed_out: bool,
    cancelled: bool,
    error: Option<String>,
    wave: Vec<TaskId>,
    priorities: HashMap<TaskId, i32>,
    wave_workers: Arc<WorkerMap>,
    wave_token: Option<CancellationToken>,
    wave_reason: Arc<OnceLock<String>>,
    wave_handle: Option<JoinHandle<Vec<TaskOutcome>>>,
    wave_progress: bool,
}

impl<'a> PlanRun<'a> {
    fn new(
        orchestrator: &'a Orchestrator,
        plan_id: PlanId,
        options: ExecutionOptions,
        context: PlanContext,
        cancel: CancellationToken,
    ) -> Self {
        let phases = PhaseController::new(plan_id, Arc::clone(orchestrator.events()));
        Self {
            orchestrator,
            plan_id,
            resolver: AssignmentResolver::new(options.capability_match),
            options,
            context,
            phases,
            cancel,
            started: Instant::now(),
            retries: 0,
            exhausted: false,
            timed_out: false,
            cancelled: false,
            error: None,
            wave: Vec::new(),
            priorities: HashMap::new(),
            wave_workers: Arc::new(HashMap::new()),
            wave_token: None,
            wave_reason: Arc::new(OnceLock::new()),
            wave_handle: None,
            wave_progress: false,
        }
    }

    fn store(&self) -> &'a TaskStore {
        &self.orchestrator.store
    }

    async fn drive(mut self) -> ExecutionSummary {
        loop {
            let next = match self.phases.current() {
                Phase::Planning => self.planning().await,
                Phase::Delegation => self.delegation().await,
                Phase::Execution => self.execution(),
                Phase::Monitoring => self.monitoring().await,
                Phase::FailureHandling => self.failure_handling().await,
                Phase::Completion | Phase::Error => break,
            };
            let next = next.unwrap_or_else(|e| {
                clog_error!(
                    "Plan {}: {} failed: {}",
                    self.plan_id.short(),
                    self.phases.current(),
                    e
                );
                self.error = Some(e.to_string());
                Phase::Error
            });
            if let Err(e) = self.phases.transition(next) {
                clog_error!("Plan {}: {}", self.plan_id.short(), e);
                self.error.get_or_insert_with(|| e.to_string());
                let _ = self.phases.transition(Phase::Error);
            }
        }

        self.stop_wave().await;
        self.finish()
    }

    async fn planning(&mut self) -> Result<Phase> {
        let (root, name, goal, existing) = self.store().read_plan(&self.plan_id, |plan| {
            let goal = if plan.description.trim().is_empty() {
                plan.name.clone()
            } else {
                plan.description.clone()
            };
            (
                plan.root_task_ids.first().copied(),
                plan.name.clone(),
                goal,
                plan.task_count() > 1,
            )
        })?;
        let root = root.ok_or_else(|| Error::Validation("plan has no root task".to_string()))?;

        let drafts = match self.options.tasks.take() {
            Some(drafts) => drafts,
            None if existing => {
                clog!("Plan {}: using tasks already in the plan", self.plan_id.short());
                return Ok(Phase::Delegation);
            }
            None => self.decompose(&goal).await,
        };

        let tasks = tasks_from_drafts(
            &drafts,
            root,
            self.options.max_subtasks,
            self.options.max_depth,
        );
        if !tasks.is_empty() {
            match self.store().add_tasks(&self.plan_id, tasks) {
                Ok(ids) => {
                    clog!("Plan {}: planned {} task(s)", self.plan_id.short(), ids.len());
                    return Ok(Phase::Delegation);
                }
                Err(e) if matches!(e, Error::NotFound { .. }) => return Err(e),
                Err(e) => {
                    clog_warn!("Plan {}: planned tasks rejected: {}", self.plan_id.short(), e)
                }
            }
        }

        if existing {
            return Ok(Phase::Delegation);
        }
        clog_warn!("Plan {}: no usable tasks, falling back to a single task", self.plan_id.short());
        self.store()
            .add_task(&self.plan_id, Task::new(&name, &goal).with_parent(root))?;
        Ok(Phase::Delegation)
    }

    async fn decompose(&self, goal: &str) -> Vec<TaskDraft> {
        let Some(planner) = &self.orchestrator.planner else {
            return Vec::new();
        };
        let call = planner.decompose(
            goal,
            &self.context,
            self.options.max_subtasks,
            self.options.max_depth,
        );
        let remaining = self.options.timeout.saturating_sub(self.started.elapsed());
        tokio::select! {
            _ = self.cancel.cancelled() => Vec::new(),
            outcome = tokio::time::timeout(remaining, call) => match outcome {
                Ok(Ok(drafts)) => drafts,
                Ok(Err(e)) => {
                    clog_warn!("Plan {}: planner failed: {}", self.plan_id.short(), e);
                    Vec::new()
                }
                Err(_) => {
                    clog_warn!("Plan {}: planner timed out", self.plan_id.short());
                    Vec::new()
                }
            },
        }
    }

    async fn delegation(&mut self) -> Result<Phase> {
        if self.cancel.is_cancelled() {
            self.mark_cancelled().await?;
            return Ok(Phase::Completion);
        }

        let workers = self.orchestrator.worker_snapshot();
        let available = self.orchestrator.available(&workers);
        let candidates = self.store().pending_leaves(&self.plan_id)?;
        let mut unassigned = 0usize;
        self.wave.clear();
        self.priorities.clear();

        for task in candidates {
            let current = task
                .assigned_worker
                .as_ref()
                .filter(|id| available.iter().any(|w| &w.id == *id && w.active))
                .cloned();
            let chosen = match current {
                Some(id) => Some(id),
                None => self.resolver.resolve(
                    &task,
                    &available,
                    self.options.preferred_worker.as_ref(),
                ),
            };

            let Some(worker) = chosen else {
                unassigned += 1;
                if task.assigned_worker.is_some() {
                    self.store().clear_assignment(&self.plan_id, &task.id)?;
                }
                continue;
            };
            if task.assigned_worker.as_ref() != Some(&worker) {
                match self.store().assign(&self.plan_id, &task.id, worker.clone()) {
                    Ok(()) => {
                        clog_debug!("Plan {}: {} -> {}", self.plan_id.short(), task.name, worker)
                    }
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) => {
                        clog_debug!("Plan {}: skipping {}: {}", self.plan_id.short(), task.name, e);
                        continue;
                    }
                }
            }
            self.priorities.insert(task.id, task.priority);
            self.wave.push(task.id);
        }

        if unassigned > 0 {
            clog_warn!(
                "Plan {}: {} task(s) have no eligible worker and stay pending",
                self.plan_id.short(),
                unassigned
            );
        }
        self.wave_workers = workers;
        Ok(Phase::Execution)
    }

    fn execution(&mut self) -> Result<Phase> {
        self.wave_progress = false;
        if self.wave.is_empty() {
            clog_debug!("Plan {}: nothing to dispatch", self.plan_id.short());
            return Ok(Phase::Monitoring);
        }

        let token = self.cancel.child_token();
        self.wave_reason = Arc::new(OnceLock::new());
        let runner = TaskRunner::new(
            Arc::clone(&self.orchestrator.store),
            self.plan_id,
            Arc::clone(&self.wave_workers),
            self.context.clone(),
            token.clone(),
        )
        .with_cancel_reason(Arc::clone(&self.wave_reason));
        let chosen = self.options.strategy.clone();
        let wave = std::mem::take(&mut self.wave);
        let priorities = std::mem::take(&mut self.priorities);
        clog!(
            "Plan {}: dispatching {} task(s) via {}",
            self.plan_id.short(),
            wave.len(),
            chosen.kind
        );

        self.wave_handle = Some(tokio::spawn(async move {
            strategy::run(&chosen, &runner, &wave, &priorities).await
        }));
        self.wave_token = Some(token);
        Ok(Phase::Monitoring)
    }

    async fn monitoring(&mut self) -> Result<Phase> {
        loop {
            if self.cancel.is_cancelled() {
                self.mark_cancelled().await?;
                return Ok(Phase::Completion);
            }
            if self.started.elapsed() >= self.options.timeout {
                self.time_out().await?;
                return Ok(Phase::Completion);
            }

            self.collect_wave().await?;
            let (failed, in_progress, all_terminal) = self.store().read_plan(&self.plan_id, |plan| {
                (
                    plan.count_leaves_with(TaskStatus::Failed),
                    plan.count_leaves_with(TaskStatus::InProgress),
                    plan.all_leaves_terminal(),
                )
            })?;

            // Siblings of a failed task finish their wave before anything is retried.
            if self.wave_handle.is_none() && in_progress == 0 {
                if failed > 0 {
                    return Ok(Phase::FailureHandling);
                }
                if all_terminal {
                    return Ok(Phase::Completion);
                }
                let ready = !self.store().get_ready_leaves(&self.plan_id)?.is_empty();
                if self.wave_progress && ready {
                    return Ok(Phase::Delegation);
                }
                clog_warn!("Plan {}: stalled with unfinished tasks", self.plan_id.short());
                return Ok(Phase::FailureHandling);
            }

            self.pause(self.options.poll_interval).await;
        }
    }

    async fn failure_handling(&mut self) -> Result<Phase> {
        if self.cancel.is_cancelled() {
            self.mark_cancelled().await?;
            return Ok(Phase::Completion);
        }
        if self.retries >= self.options.max_retries {
            self.exhausted = true;
            clog_warn!(
                "Plan {}: giving up after {} retr{}",
                self.plan_id.short(),
                self.retries,
                if self.retries == 1 { "y" } else { "ies" }
            );
            return Ok(Phase::Completion);
        }

        self.retries += 1;
        let reset = self.store().reset_failed(&self.plan_id)?;
        clog!(
            "Plan {}: retry {}/{} resetting {} task(s), waiting {:?}",
            self.plan_id.short(),
            self.retries,
            self.options.max_retries,
            reset.len(),
            self.options.retry_delay
        );
        self.pause(self.options.retry_delay).await;
        Ok(Phase::Delegation)
    }

    /// Sleep, waking early on cancellation.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn collect_wave(&mut self) -> Result<()> {
        if !self.wave_handle.as_ref().is_some_and(|h| h.is_finished()) {
            return Ok(());
        }
        if let Some(handle) = self.wave_handle.take() {
            self.wave_token = None;
            let outcomes = handle.await.map_err(|e| Error::TaskJoin(e.to_string()))?;
            let started = outcomes.iter().filter(|o| o.started()).count();
            self.wave_progress = started > 0;
            clog_debug!(
                "Plan {}: wave finished, {} of {} task(s) ran",
                self.plan_id.short(),
                started,
                outcomes.len()
            );
        }
        Ok(())
    }

    async fn stop_wave(&mut self) {
        if let Some(token) = self.wave_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.wave_handle.take() {
            if let Err(e) = handle.await {
                clog_warn!("Plan {}: wave join failed: {}", self.plan_id.short(), e);
            }
        }
    }

    async fn time_out(&mut self) -> Result<()> {
        self.timed_out = true;
        // Interrupted runners record the timeout themselves.
        let _ = self.wave_reason.set("timeout".to_string());
        let interrupted = self
            .store()
            .read_plan(&self.plan_id, |plan| plan.count_leaves_with(TaskStatus::InProgress))?;
        self.stop_wave().await;
        let stray = self.store().fail_in_progress(&self.plan_id, "timeout")?;
        clog_warn!(
            "Plan {}: timed out after {:?}, failed {} in-flight task(s)",
            self.plan_id.short(),
            self.options.timeout,
            interrupted.max(stray.len())
        );
        Ok(())
    }

    async fn mark_cancelled(&mut self) -> Result<()> {
        self.cancelled = true;
        self.stop_wave().await;
        let failed = self.store().fail_unfinished(&self.plan_id, "cancelled")?;
        clog!(
            "Plan {}: cancelled, failed {} unfinished task(s)",
            self.plan_id.short(),
            failed.len()
        );
        Ok(())
    }

    fn finish(&mut self) -> ExecutionSummary {
        let store = self.store();
        let snapshot = store
            .get_plan(&self.plan_id)
            .and_then(|plan| Ok((store.topological_order(&self.plan_id)?, plan)));
        let mut summary = match snapshot {
            Ok((order, plan)) => ExecutionSummary::from_plan(&plan, &order),
            Err(e) => ExecutionSummary::unavailable(self.plan_id, e.to_string()),
        };

        summary.retries = self.retries;
        summary.timed_out = self.timed_out;
        summary.cancelled = self.cancelled;
        summary.status = if self.phases.current() == Phase::Error {
            SummaryStatus::Error
        } else {
            SummaryStatus::classify(summary.completed, summary.total, self.cancelled)
        };
        if summary.error.is_none() {
            summary.error = if let Some(e) = self.error.clone() {
                Some(e)
            } else if self.timed_out {
                Some(Error::Timeout(self.options.timeout).to_string())
            } else if self.cancelled {
                Some(Error::Cancelled.to_string())
            } else if self.exhausted {
                Some(
                    Error::RetriesExhausted {
                        attempts: self.retries,
                    }
                    .to_string(),
                )
            } else {
                None
            };
        }
        summary.phases = self.phases.phases();
        let summary = summary.with_duration(self.started.elapsed());

        clog!(
            "Plan {}: {} ({}/{} completed, {} failed, {} retries, {}ms)",
            self.plan_id.short(),
            summary.status,
            summary.completed,
            summary.total,
            summary.failed,
            summary.retries,
            summary.duration_ms
        );
        self.orchestrator.events().publish(Event::PlanCompleted {
            plan_id: self.plan_id,
            status: summary.plan_status,
            outcome: summary.status.to_string(),
        });
        summary
    }
}

impl Drop for PlanRun<'_> {
    fn drop(&mut self) {
        if let Some(token) = &self.wave_token {
            token.cancel();
        }
    }
}
