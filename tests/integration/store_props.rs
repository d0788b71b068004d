//! Store invariants under longer mutation sequences.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde_json::json;

use conductor::core::propagate::{is_consistent, propagate};
use conductor::{
    Error, Event, EventKind, Plan, PlanContext, PlanId, Task, TaskId, TaskStatus, TaskStore,
    TaskUpdate,
};

/// Two-level plan:
///
/// ```text
/// root ── build ── compile, link (link depends on compile)
///      └─ ship ─── package (depends on link), upload (depends on package)
/// ```
struct Fixture {
    store: TaskStore,
    plan: PlanId,
    compile: TaskId,
    link: TaskId,
    package: TaskId,
    upload: TaskId,
}

impl Fixture {
    fn new() -> Self {
        let store = TaskStore::default();
        let plan = store.create_plan("release", "ship it", PlanContext::new()).unwrap();
        let root = plan.root_task_ids[0];
        let build = store.add_task(&plan.id, Task::new("build", "").with_parent(root)).unwrap();
        let ship = store.add_task(&plan.id, Task::new("ship", "").with_parent(root)).unwrap();
        let compile = store
            .add_task(&plan.id, Task::new("compile", "").with_parent(build))
            .unwrap();
        let link = store
            .add_task(
                &plan.id,
                Task::new("link", "").with_parent(build).with_dependencies([compile]),
            )
            .unwrap();
        let package = store
            .add_task(
                &plan.id,
                Task::new("package", "").with_parent(ship).with_dependencies([link]),
            )
            .unwrap();
        let upload = store
            .add_task(
                &plan.id,
                Task::new("upload", "").with_parent(ship).with_dependencies([package]),
            )
            .unwrap();
        Self {
            store,
            plan: plan.id,
            compile,
            link,
            package,
            upload,
        }
    }

    fn plan(&self) -> Plan {
        self.store.get_plan(&self.plan).unwrap()
    }

    fn ready(&self) -> BTreeSet<TaskId> {
        self.store
            .get_ready_tasks(&self.plan)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    fn update(&self, task: TaskId, update: TaskUpdate) {
        self.store.update_task_status(&self.plan, &task, update).unwrap();
    }

    /// Re-check readiness and propagation against the plan snapshot.
    fn check(&self) {
        let plan = self.plan();
        let expected: BTreeSet<TaskId> = plan
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.dependencies
                        .iter()
                        .all(|d| plan.tasks[d].status == TaskStatus::Completed)
            })
            .map(|t| t.id)
            .collect();
        assert_eq!(self.ready(), expected);
        assert!(is_consistent(&plan), "derived statuses drifted: {:?}", plan.status);
    }
}

/// Test: Readiness and propagation through a full lifecycle
/// Given a two-level plan with a dependency chain across branches
/// When tasks start, fail, reset and complete in sequence
/// Then the ready set and every derived status hold after each step
#[test]
fn test_invariants_hold_through_lifecycle() {
    let f = Fixture::new();
    f.check();
    assert!(f.ready().contains(&f.compile));
    assert!(!f.ready().contains(&f.link));

    let steps: Vec<(TaskId, TaskUpdate)> = vec![
        (f.compile, TaskUpdate::started(None)),
        (f.compile, TaskUpdate::completed(json!("obj"))),
        (f.link, TaskUpdate::started(None)),
        (f.link, TaskUpdate::failed("linker error")),
        (f.link, TaskUpdate::new(TaskStatus::Pending)),
        (f.link, TaskUpdate::started(None)),
        (f.link, TaskUpdate::completed(json!("bin"))),
        (f.package, TaskUpdate::started(None)),
        (f.package, TaskUpdate::completed(json!("tar"))),
        (f.upload, TaskUpdate::started(None)),
        (f.upload, TaskUpdate::completed(json!("url"))),
    ];
    for (task, update) in steps {
        f.update(task, update);
        f.check();
    }

    let plan = f.plan();
    assert_eq!(plan.status, TaskStatus::Completed);
    assert_eq!(plan.task(&f.link).unwrap().attempts, 2);
    assert!(f.ready().is_empty());
}

/// Test: Failure precedence
/// Given one failed leaf and one running leaf under the same parent
/// When statuses propagate
/// Then the parent and the plan are failed
#[test]
fn test_failed_child_outranks_in_progress_sibling() {
    let f = Fixture::new();
    f.update(f.compile, TaskUpdate::started(None));
    f.update(f.compile, TaskUpdate::failed("oom"));
    f.update(f.package, TaskUpdate::started(None));

    let plan = f.plan();
    assert_eq!(plan.task_by_name("build").unwrap().status, TaskStatus::Failed);
    assert_eq!(plan.task_by_name("ship").unwrap().status, TaskStatus::InProgress);
    assert_eq!(plan.status, TaskStatus::Failed);
    f.check();
}

/// Test: Propagation is idempotent
/// Given a plan after several updates
/// When propagate runs twice on the same leaf
/// Then the second run changes nothing
#[test]
fn test_propagate_twice_is_a_no_op() {
    let f = Fixture::new();
    f.update(f.compile, TaskUpdate::started(None));
    f.update(f.compile, TaskUpdate::completed(json!(1)));

    let mut plan = f.plan();
    propagate(&mut plan, &f.compile);
    let statuses = |p: &Plan| {
        let mut all: Vec<(TaskId, TaskStatus)> =
            p.tasks.values().map(|t| (t.id, t.status)).collect();
        all.sort_by_key(|(id, _)| *id);
        (all, p.status)
    };
    let once = statuses(&plan);
    let second = propagate(&mut plan, &f.compile);

    assert!(second.is_empty());
    assert_eq!(statuses(&plan), once);
}

/// Test: No partial insert
/// Given a batch whose last task closes a cycle
/// When the batch is added
/// Then it is rejected and the plan is unchanged
#[test]
fn test_cyclic_batch_leaves_plan_unchanged() {
    let f = Fixture::new();
    let before = f.plan();

    let mut looped = Task::new("looped", "");
    looped.dependencies.insert(looped.id);

    // a -> b -> c -> a, with a also hanging off an existing task.
    let mut a = Task::new("a", "").with_dependencies([f.upload]);
    let b = Task::new("b", "").with_dependencies([a.id]);
    let c = Task::new("c", "").with_dependencies([b.id]);
    a.dependencies.insert(c.id);

    let self_err = f.store.add_tasks(&f.plan, vec![looped]).unwrap_err();
    let cycle_err = f.store.add_tasks(&f.plan, vec![a, b, c]).unwrap_err();

    assert!(matches!(self_err, Error::InvalidDependency(_)));
    assert!(matches!(cycle_err, Error::InvalidDependency(_)));
    let after = f.plan();
    assert_eq!(after.task_count(), before.task_count());
    assert_eq!(after.root_task_ids, before.root_task_ids);
    f.check();
}

/// Test: Ancestor dependency
/// Given a new leaf under `ship`
/// When it depends on `ship` itself
/// Then the insert is rejected as a cycle
#[test]
fn test_dependency_on_ancestor_rejected() {
    let f = Fixture::new();
    let ship = f.plan().task_by_name("ship").unwrap().id;

    let err = f
        .store
        .add_task(
            &f.plan,
            Task::new("notify", "").with_parent(ship).with_dependencies([ship]),
        )
        .unwrap_err();

    assert!(matches!(err, Error::InvalidDependency(_)));
}

/// Test: Event order for one update
/// Given subscribers on the store's bus
/// When a leaf starts
/// Then the leaf's change, task_started, and each ancestor's change arrive in that order
#[test]
fn test_event_order_for_leaf_start() {
    let f = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    f.store.events().subscribe(
        move |e: &Event| sink.lock().unwrap().push((e.kind(), e.task_id())),
        Some(&[EventKind::TaskStarted, EventKind::TaskStatusChanged]),
    );
    let plan = f.plan();
    let build = plan.task_by_name("build").unwrap().id;
    let root = plan.root_task_ids[0];

    f.update(f.compile, TaskUpdate::started(None));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (EventKind::TaskStatusChanged, Some(f.compile)),
            (EventKind::TaskStarted, Some(f.compile)),
            (EventKind::TaskStatusChanged, Some(build)),
            (EventKind::TaskStatusChanged, Some(root)),
        ]
    );
}

/// Test: Concurrent writers
/// Given many independent leaves updated from several threads
/// When every thread finishes
/// Then every leaf is completed and the parents agree
#[test]
fn test_concurrent_updates_serialize() {
    let store = Arc::new(TaskStore::default());
    let plan = store.create_plan("fan", "", PlanContext::new()).unwrap();
    let root = plan.root_task_ids[0];
    let leaves: Vec<TaskId> = (0..32)
        .map(|i| {
            store
                .add_task(&plan.id, Task::new(&format!("leaf-{}", i), "").with_parent(root))
                .unwrap()
        })
        .collect();

    let handles: Vec<_> = leaves
        .chunks(8)
        .map(|chunk| {
            let store = Arc::clone(&store);
            let chunk = chunk.to_vec();
            let plan_id = plan.id;
            std::thread::spawn(move || {
                for id in chunk {
                    store
                        .update_task_status(&plan_id, &id, TaskUpdate::started(None))
                        .unwrap();
                    let result = json!(id.to_string());
                    store
                        .update_task_status(&plan_id, &id, TaskUpdate::completed(result))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let plan = store.get_plan(&plan.id).unwrap();
    assert_eq!(plan.count_leaves_with(TaskStatus::Completed), 32);
    assert_eq!(plan.status, TaskStatus::Completed);
    assert!(is_consistent(&plan));
}
