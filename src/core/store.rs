//! Task graph store.
//!
//! Owns every plan and its tasks. Each plan lives behind its own mutex, so
//! concurrent task completions on one plan serialize their writes while
//! different plans never contend. Readiness checks take the same lock and
//! therefore always see a consistent snapshot.
//!
//! Alongside the task map each plan keeps a petgraph `DiGraph` with two
//! kinds of edges: `dependency -> dependent` and `child -> parent`. Inserts
//! are validated on a tentative copy of the graph and committed only if it
//! stays acyclic, so a rejected insert never leaves partial state behind.

use crate::core::plan::{Plan, PlanContext, PlanId};
use crate::core::propagate::{self, Propagation};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::registry::WorkerId;
use crate::util;
use crate::{clog, clog_debug, clog_warn};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Why an edge exists in the plan graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    /// The source must complete before the target may start.
    Dependency,
    /// The source is a child of the target.
    Containment,
}

/// One plan plus its graph index.
#[derive(Debug, Clone)]
struct PlanGraph {
    plan: Plan,
    graph: DiGraph<TaskId, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
}

impl PlanGraph {
    fn new(plan: Plan) -> Self {
        Self {
            plan,
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    fn node(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(id);
        self.index.insert(id, idx);
        idx
    }

    /// Task ids in dependency order; children precede their parents.
    fn topological(&self) -> Vec<TaskId> {
        match toposort(&self.graph, None) {
            Ok(order) => order.into_iter().map(|idx| self.graph[idx]).collect(),
            Err(_) => {
                // Unreachable while inserts are validated; fall back to age.
                let mut ids: Vec<&Task> = self.plan.tasks.values().collect();
                ids.sort_by_key(|t| (t.created_at, t.id));
                ids.into_iter().map(|t| t.id).collect()
            }
        }
    }
}

/// Field updates applied together with a status change.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub assigned_worker: Option<WorkerId>,
}

impl TaskUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            failure_reason: None,
            assigned_worker: None,
        }
    }

    pub fn started(worker: Option<WorkerId>) -> Self {
        Self {
            assigned_worker: worker,
            ..Self::new(TaskStatus::InProgress)
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self::new(TaskStatus::Completed).with_result(result)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(TaskStatus::Failed).with_failure(reason)
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.assigned_worker = Some(worker);
        self
    }
}

/// In-memory arena of plans, one lock per plan.
#[derive(Debug)]
pub struct TaskStore {
    plans: RwLock<HashMap<PlanId, Arc<Mutex<PlanGraph>>>>,
    events: Arc<EventBus>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(Arc::new(EventBus::new()))
    }
}

impl TaskStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn entry(&self, plan_id: &PlanId) -> Result<Arc<Mutex<PlanGraph>>> {
        util::read(&self.plans)
            .get(plan_id)
            .cloned()
            .ok_or_else(|| Error::plan_not_found(plan_id))
    }

    /// Run `f` with the plan locked, then deliver any events it queued.
    fn with_graph<R>(
        &self,
        plan_id: &PlanId,
        f: impl FnOnce(&mut PlanGraph) -> Result<R>,
    ) -> Result<R> {
        let entry = self.entry(plan_id)?;
        let result = {
            let mut graph = util::lock(&entry);
            f(&mut graph)
        };
        self.events.flush();
        result
    }

    /// Create a plan holding a single root task.
    ///
    /// The root carries the plan's name and description. Tasks added later
    /// with the root as parent turn it into a derived-status parent.
    pub fn create_plan(&self, name: &str, description: &str, context: PlanContext) -> Result<Plan> {
        context.validate()?;
        let mut plan = Plan::new(name, description, context);
        let root = Task::new(name, description);
        let root_id = root.id;
        plan.root_task_ids.push(root_id);
        plan.tasks.insert(root_id, root);

        let mut graph = PlanGraph::new(plan);
        graph.node(root_id);
        let snapshot = graph.plan.clone();

        util::write(&self.plans).insert(snapshot.id, Arc::new(Mutex::new(graph)));
        clog!("Store: created plan {} ({}) root={}", snapshot.id.short(), name, root_id.short());
        Ok(snapshot)
    }

    /// Root task created together with the plan.
    pub fn root_task(&self, plan_id: &PlanId) -> Result<TaskId> {
        self.with_graph(plan_id, |g| {
            g.plan
                .root_task_ids
                .first()
                .copied()
                .ok_or_else(|| Error::Validation(format!("plan {} has no root task", plan_id)))
        })
    }

    /// Insert one task. See [`TaskStore::add_tasks`].
    pub fn add_task(&self, plan_id: &PlanId, task: Task) -> Result<TaskId> {
        let mut ids = self.add_tasks(plan_id, vec![task])?;
        ids.pop()
            .ok_or_else(|| Error::Validation("empty insert".to_string()))
    }

    /// Insert a batch of tasks atomically.
    ///
    /// Tasks may reference each other (as dependencies or parents) as well
    /// as tasks already in the plan. A task without a parent becomes a new
    /// root. The whole batch is rejected when any task:
    /// - repeats an existing id or is not a fresh pending leaf,
    /// - names an unknown parent or dependency, or depends on itself,
    /// - would be placed under a leaf that has already started,
    /// - closes a cycle through dependencies or ancestry.
    pub fn add_tasks(&self, plan_id: &PlanId, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let outcome = self.with_graph(plan_id, |g| {
            let mut tentative = g.clone();
            let ids = insert_batch(&mut tentative, tasks)?;
            for id in &ids {
                let change = propagate::propagate(&mut tentative.plan, id);
                queue_propagation(&self.events, plan_id, &change);
            }
            *g = tentative;
            Ok(ids)
        });

        match &outcome {
            Ok(ids) => clog_debug!("Store: plan {} added {} task(s)", plan_id.short(), ids.len()),
            Err(e) => clog_warn!("Store: plan {} rejected insert: {}", plan_id.short(), e),
        }
        outcome
    }

    pub fn get_task(&self, plan_id: &PlanId, task_id: &TaskId) -> Result<Task> {
        self.with_graph(plan_id, |g| {
            g.plan
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| Error::task_not_found(task_id))
        })
    }

    /// Snapshot of the plan.
    pub fn get_plan(&self, plan_id: &PlanId) -> Result<Plan> {
        self.with_graph(plan_id, |g| Ok(g.plan.clone()))
    }

    /// Read the plan under its lock without cloning it.
    pub fn read_plan<R>(&self, plan_id: &PlanId, f: impl FnOnce(&Plan) -> R) -> Result<R> {
        self.with_graph(plan_id, |g| Ok(f(&g.plan)))
    }

    /// Snapshots of every plan, oldest first.
    pub fn list_plans(&self) -> Vec<Plan> {
        let entries: Vec<Arc<Mutex<PlanGraph>>> =
            util::read(&self.plans).values().cloned().collect();
        let mut plans: Vec<Plan> = entries
            .iter()
            .map(|entry| util::lock(entry).plan.clone())
            .collect();
        plans.sort_by_key(|p| (p.created_at, p.id));
        plans
    }

    pub fn contains_plan(&self, plan_id: &PlanId) -> bool {
        util::read(&self.plans).contains_key(plan_id)
    }

    /// Remove a plan and all its tasks. Returns whether it existed.
    pub fn delete_plan(&self, plan_id: &PlanId) -> bool {
        let removed = util::write(&self.plans).remove(plan_id).is_some();
        if removed {
            clog!("Store: deleted plan {}", plan_id.short());
        }
        removed
    }

    /// Every pending task whose dependencies are all completed, in
    /// dependency order.
    pub fn get_ready_tasks(&self, plan_id: &PlanId) -> Result<Vec<Task>> {
        self.with_graph(plan_id, |g| {
            Ok(g.topological()
                .into_iter()
                .filter(|id| g.plan.is_ready(id))
                .filter_map(|id| g.plan.tasks.get(&id).cloned())
                .collect())
        })
    }

    /// Ready tasks that a worker can execute: leaves, minus an idle goal
    /// root.
    pub fn get_ready_leaves(&self, plan_id: &PlanId) -> Result<Vec<Task>> {
        self.with_graph(plan_id, |g| {
            Ok(g.topological()
                .into_iter()
                .filter(|id| g.plan.is_ready(id) && is_executable(&g.plan, id))
                .filter_map(|id| g.plan.tasks.get(&id).cloned())
                .collect())
        })
    }

    /// Pending leaves in dependency order, minus those with a failed
    /// dependency.
    pub fn pending_leaves(&self, plan_id: &PlanId) -> Result<Vec<Task>> {
        self.with_graph(plan_id, |g| {
            Ok(g.topological()
                .into_iter()
                .filter_map(|id| g.plan.tasks.get(&id))
                .filter(|t| {
                    is_executable(&g.plan, &t.id)
                        && t.status == TaskStatus::Pending
                        && !g.plan.is_blocked(&t.id)
                })
                .cloned()
                .collect())
        })
    }

    /// Every task id in dependency order.
    pub fn topological_order(&self, plan_id: &PlanId) -> Result<Vec<TaskId>> {
        self.with_graph(plan_id, |g| Ok(g.topological()))
    }

    /// Apply a status change to a leaf and propagate it upwards.
    ///
    /// Fails with `DerivedStatus` for parents and `InvalidStatusTransition`
    /// when the move breaks the lifecycle; neither failure mutates anything.
    pub fn update_task_status(
        &self,
        plan_id: &PlanId,
        task_id: &TaskId,
        update: TaskUpdate,
    ) -> Result<Task> {
        self.with_graph(plan_id, |g| apply_update(&self.events, plan_id, g, task_id, update))
    }

    /// Explicit retry reset: `failed -> pending`, clearing the worker,
    /// result and failure reason.
    pub fn reset_task(&self, plan_id: &PlanId, task_id: &TaskId) -> Result<Task> {
        self.update_task_status(plan_id, task_id, TaskUpdate::new(TaskStatus::Pending))
    }

    /// Reset every failed leaf. Returns the ids that were reset.
    pub fn reset_failed(&self, plan_id: &PlanId) -> Result<Vec<TaskId>> {
        self.with_graph(plan_id, |g| {
            let failed = leaves_where(g, |t| t.status == TaskStatus::Failed);
            for id in &failed {
                apply_update(&self.events, plan_id, g, id, TaskUpdate::new(TaskStatus::Pending))?;
            }
            Ok(failed)
        })
    }

    /// Fail every in-progress leaf with `reason`.
    pub fn fail_in_progress(&self, plan_id: &PlanId, reason: &str) -> Result<Vec<TaskId>> {
        self.fail_leaves(plan_id, reason, |t| t.status == TaskStatus::InProgress)
    }

    /// Fail every leaf that has not reached a terminal state.
    pub fn fail_unfinished(&self, plan_id: &PlanId, reason: &str) -> Result<Vec<TaskId>> {
        self.fail_leaves(plan_id, reason, |t| !t.is_finished())
    }

    fn fail_leaves(
        &self,
        plan_id: &PlanId,
        reason: &str,
        pick: impl Fn(&Task) -> bool,
    ) -> Result<Vec<TaskId>> {
        self.with_graph(plan_id, |g| {
            let targets = leaves_where(g, pick);
            for id in &targets {
                apply_update(&self.events, plan_id, g, id, TaskUpdate::failed(reason))?;
            }
            Ok(targets)
        })
    }

    /// Record the worker chosen for a pending leaf.
    pub fn assign(&self, plan_id: &PlanId, task_id: &TaskId, worker: WorkerId) -> Result<()> {
        self.with_graph(plan_id, |g| {
            let task = g
                .plan
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::task_not_found(task_id))?;
            if !task.is_leaf() {
                return Err(Error::DerivedStatus {
                    task: task_id.to_string(),
                });
            }
            if task.status != TaskStatus::Pending {
                return Err(Error::Validation(format!(
                    "task {} is {} and cannot be reassigned",
                    task_id, task.status
                )));
            }
            task.assigned_worker = Some(worker);
            task.touch();
            g.plan.touch();
            Ok(())
        })
    }

    pub fn clear_assignment(&self, plan_id: &PlanId, task_id: &TaskId) -> Result<()> {
        self.with_graph(plan_id, |g| {
            let task = g
                .plan
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::task_not_found(task_id))?;
            if task.status == TaskStatus::Pending && task.assigned_worker.take().is_some() {
                task.touch();
            }
            Ok(())
        })
    }
}

/// Leaves that a worker may run; an idle goal root never is.
fn is_executable(plan: &Plan, id: &TaskId) -> bool {
    plan.tasks.get(id).is_some_and(Task::is_leaf) && !plan.is_idle_goal_root(id)
}

fn leaves_where(g: &PlanGraph, pick: impl Fn(&Task) -> bool) -> Vec<TaskId> {
    g.topological()
        .into_iter()
        .filter(|id| is_executable(&g.plan, id) && g.plan.tasks.get(id).is_some_and(|t| pick(t)))
        .collect()
}

fn insert_batch(g: &mut PlanGraph, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
    let mut batch: HashSet<TaskId> = HashSet::new();
    for task in &tasks {
        if g.plan.tasks.contains_key(&task.id) || !batch.insert(task.id) {
            return Err(Error::Validation(format!("duplicate task id {}", task.id)));
        }
        if task.status != TaskStatus::Pending || !task.children.is_empty() {
            return Err(Error::Validation(format!(
                "task {} must be inserted as a pending leaf",
                task.name
            )));
        }
    }

    let known =
        |id: &TaskId, batch: &HashSet<TaskId>| g.plan.tasks.contains_key(id) || batch.contains(id);
    for task in &tasks {
        if task.dependencies.contains(&task.id) {
            return Err(Error::InvalidDependency(format!(
                "task {} depends on itself",
                task.name
            )));
        }
        if let Some(dep) = task.dependencies.iter().find(|d| !known(d, &batch)) {
            return Err(Error::InvalidDependency(format!(
                "task {} depends on unknown task {}",
                task.name, dep
            )));
        }
        if let Some(parent) = task.parent_id {
            if parent == task.id || !known(&parent, &batch) {
                return Err(Error::InvalidDependency(format!(
                    "task {} has unknown parent {}",
                    task.name, parent
                )));
            }
            if let Some(existing) = g.plan.tasks.get(&parent) {
                if existing.is_leaf() && existing.status != TaskStatus::Pending {
                    return Err(Error::Validation(format!(
                        "cannot add children to task {} which is already {}",
                        existing.name, existing.status
                    )));
                }
            }
        }
    }

    let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
    for id in &ids {
        g.node(*id);
    }
    for task in &tasks {
        let target = g.index[&task.id];
        for dep in &task.dependencies {
            let source = g.node(*dep);
            g.graph.add_edge(source, target, EdgeKind::Dependency);
        }
        if let Some(parent) = task.parent_id {
            let parent_idx = g.node(parent);
            g.graph.add_edge(target, parent_idx, EdgeKind::Containment);
        }
    }

    if is_cyclic_directed(&g.graph) {
        return Err(Error::InvalidDependency(
            "insert would create a dependency cycle".to_string(),
        ));
    }

    for task in tasks {
        if task.parent_id.is_none() {
            g.plan.root_task_ids.push(task.id);
        }
        g.plan.tasks.insert(task.id, task);
    }
    // Link after inserting: a parent may arrive later in the same batch.
    for id in &ids {
        let parent = g.plan.tasks.get(id).and_then(|t| t.parent_id);
        if let Some(parent_task) = parent.and_then(|p| g.plan.tasks.get_mut(&p)) {
            parent_task.children.push(*id);
            parent_task.touch();
        }
    }
    g.plan.touch();
    Ok(ids)
}

fn apply_update(
    events: &EventBus,
    plan_id: &PlanId,
    g: &mut PlanGraph,
    task_id: &TaskId,
    update: TaskUpdate,
) -> Result<Task> {
    let task = g
        .plan
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| Error::task_not_found(task_id))?;
    if !task.is_leaf() {
        return Err(Error::DerivedStatus {
            task: task_id.to_string(),
        });
    }

    let from = task.status;
    task.transition(update.status)?;
    if let Some(worker) = update.assigned_worker {
        task.assigned_worker = Some(worker);
    }
    match update.status {
        TaskStatus::Completed => task.result = update.result,
        TaskStatus::Failed => {
            let reason = update.failure_reason.unwrap_or_else(|| "failed".to_string());
            task.failure_reason = Some(reason);
        }
        _ => {}
    }
    let updated = task.clone();

    clog_debug!(
        "Store: task {} ({}) {} -> {}",
        updated.id.short(),
        updated.name,
        from,
        updated.status
    );

    events.enqueue(Event::TaskStatusChanged {
        plan_id: *plan_id,
        task_id: *task_id,
        from,
        to: updated.status,
    });
    match updated.status {
        TaskStatus::InProgress => events.enqueue(Event::TaskStarted {
            plan_id: *plan_id,
            task_id: *task_id,
            worker: updated.assigned_worker.clone(),
        }),
        TaskStatus::Completed => events.enqueue(Event::TaskCompleted {
            plan_id: *plan_id,
            task_id: *task_id,
            result: updated.result.clone(),
        }),
        TaskStatus::Failed => events.enqueue(Event::TaskFailed {
            plan_id: *plan_id,
            task_id: *task_id,
            reason: updated.failure_reason.clone().unwrap_or_default(),
        }),
        TaskStatus::Pending => {}
    }

    let change = propagate::propagate(&mut g.plan, task_id);
    queue_propagation(events, plan_id, &change);
    Ok(updated)
}

fn queue_propagation(events: &EventBus, plan_id: &PlanId, change: &Propagation) {
    for c in &change.changes {
        events.enqueue(Event::TaskStatusChanged {
            plan_id: *plan_id,
            task_id: c.task_id,
            from: c.from,
            to: c.to,
        });
    }
    if let Some((from, to)) = change.plan_status {
        clog_debug!("Store: plan {} status {} -> {}", plan_id.short(), from, to);
    }
}
