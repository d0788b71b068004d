//! End-to-end plan executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use conductor::orchestration::strategy::{self, Strategy, TaskRunner};
use conductor::orchestration::{Phase, StrategyKind, SummaryStatus};
use conductor::worker::StaticPlanner;
use conductor::{
    CapabilityRegistry, Error, Event, Orchestrator, PlanContext, SharedWorker, Task, TaskStatus,
    TaskStore, TaskUpdate, WorkerId,
};

use crate::fixtures::{draft, fast_options, EmptyPlanner, FailingPlanner, Harness, ScriptedWorker};

/// Test: Scenario A - sequential chain
/// Given tasks A -> B -> C and the sequential strategy
/// When the plan executes
/// Then all three complete in order A, B, C
#[tokio::test]
async fn test_sequential_chain_runs_in_order() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("chain");
    let options = fast_options().with_tasks(vec![
        draft("A"),
        draft("B").depends_on(&["A"]),
        draft("C").depends_on(&["B"]),
    ]);

    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();

    assert_eq!(summary.status, SummaryStatus::Completed);
    assert_eq!(summary.completed, 3);
    assert_eq!(worker.log(), vec!["A", "B", "C"]);
    let names: Vec<&str> = summary.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    assert_eq!(summary.plan_status, TaskStatus::Completed);
}

/// Test: Scenario A - failure in the middle of the chain
/// Given A -> B -> C where B fails and no retries are allowed
/// When the plan executes
/// Then C never starts and the run goes through failure handling
#[tokio::test]
async fn test_sequential_chain_failure_stops_dependents() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).failing("B", 1));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("chain");
    let options = fast_options().with_max_retries(0).with_tasks(vec![
        draft("A"),
        draft("B").depends_on(&["A"]),
        draft("C").depends_on(&["B"]),
    ]);

    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();

    assert_eq!(worker.log(), vec!["A", "B"]);
    assert_eq!(summary.status, SummaryStatus::Partial);
    assert!(summary.phases.contains(&Phase::Monitoring));
    assert!(summary.phases.contains(&Phase::FailureHandling));

    let b = summary.task("B").unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.failure_reason.as_deref(), Some("scripted failure of B"));
    let c = summary.task("C").unwrap();
    assert_eq!(c.status, TaskStatus::Pending);
    assert_eq!(c.attempts, 0);
    assert_eq!(summary.plan_status, TaskStatus::Failed);
}

/// Test: Scenario B - priority split
/// Given X(9), Y(2), Z(2) and threshold 5
/// When the priority-split strategy runs
/// Then X runs on the parallel side, Y before Z, and outcomes read [X, Y, Z]
#[tokio::test]
async fn test_priority_split_reassembles_input_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let worker = Arc::new(
        ScriptedWorker::new("w", &[])
            .with_delay(Duration::from_millis(30))
            .with_log(Arc::clone(&log)),
    );
    let store = Arc::new(TaskStore::default());
    let plan = store.create_plan("split", "goal", PlanContext::new()).unwrap();
    let root = plan.root_task_ids[0];
    let mut priorities = HashMap::new();
    let mut ids = Vec::new();
    for (name, priority) in [("X", 9), ("Y", 2), ("Z", 2)] {
        let id = store
            .add_task(&plan.id, Task::new(name, name).with_priority(priority).with_parent(root))
            .unwrap();
        store.assign(&plan.id, &id, WorkerId::from("w")).unwrap();
        priorities.insert(id, priority);
        ids.push(id);
    }
    let workers: HashMap<WorkerId, SharedWorker> =
        [(WorkerId::from("w"), worker.clone() as SharedWorker)].into_iter().collect();
    let runner = TaskRunner::new(
        Arc::clone(&store),
        plan.id,
        Arc::new(workers),
        PlanContext::new(),
        CancellationToken::new(),
    );
    let strategy = Strategy {
        kind: StrategyKind::PrioritySplit,
        priority_threshold: 5,
        ..Strategy::default()
    };

    let outcomes = strategy::run(&strategy, &runner, &ids, &priorities).await;

    let order: Vec<_> = outcomes.iter().map(|o| o.task_id).collect();
    assert_eq!(order, ids);
    assert!(outcomes.iter().all(|o| o.status == TaskStatus::Completed));
    let log = log.lock().unwrap().clone();
    let y = log.iter().position(|d| d == "Y").unwrap();
    let z = log.iter().position(|d| d == "Z").unwrap();
    assert!(y < z, "sequential side keeps input order: {:?}", log);
    // X and Y start together; Z waits for Y.
    assert_eq!(worker.max_active(), 2);
}

/// Test: Scenario C - retry
/// Given a task that fails once and max_retries = 3
/// When the plan executes
/// Then the retry succeeds and the task shows two attempts
#[tokio::test]
async fn test_failed_task_is_retried_until_success() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).failing("flaky", 1));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("retry");
    let flaky = harness.add(&plan, Task::new("flaky", "flaky"));
    let before = harness.store.get_task(&plan.id, &flaky).unwrap();

    let summary = harness
        .orchestrator
        .execute_plan(plan.id, fast_options().with_max_retries(3))
        .await
        .unwrap();

    assert_eq!(summary.status, SummaryStatus::Completed);
    assert_eq!(summary.retries, 1);
    assert_eq!(worker.calls(), 2);
    let task = harness.store.get_task(&plan.id, &flaky).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
    assert!(task.updated_at > before.updated_at);
    assert!(task.failure_reason.is_none());

    let started = harness
        .events()
        .iter()
        .filter(|e| matches!(e, Event::TaskStarted { task_id, .. } if *task_id == flaky))
        .count();
    assert_eq!(started, 2);
}

/// Test: Scenario D - no eligible worker
/// Given a task requiring "x" and no worker providing it
/// When the plan executes
/// Then the task stays pending and the run ends once retries are exhausted
#[tokio::test]
async fn test_unassignable_task_exhausts_retries() {
    let harness = Harness::new(vec![Arc::new(ScriptedWorker::new("w", &["y"]))]);
    let plan = harness.plan("stuck");
    let task = harness.add(&plan, Task::new("needs-x", "x").with_capabilities(["x"]));

    let summary = harness
        .orchestrator
        .execute_plan(plan.id, fast_options().with_max_retries(2))
        .await
        .unwrap();

    assert_eq!(summary.status, SummaryStatus::Error);
    assert_eq!(summary.retries, 2);
    assert_eq!(summary.pending, 1);
    assert!(summary
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Retries exhausted")));
    let task = harness.store.get_task(&plan.id, &task).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_worker.is_none());
    let delegations = summary.phases.iter().filter(|p| **p == Phase::Delegation).count();
    assert_eq!(delegations, 3);
}

/// Test: Scenario D - worker registered during the run
/// Given an unassignable task and a worker added while retries remain
/// When the next delegation pass runs
/// Then the task is assigned and the plan completes
#[tokio::test]
async fn test_late_worker_registration_unblocks_plan() {
    let harness = Harness::new(Vec::new());
    let plan = harness.plan("late");
    harness.add(&plan, Task::new("needs-x", "x").with_capabilities(["x"]));

    let orchestrator = Arc::clone(&harness.orchestrator);
    let late = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.add_worker(Arc::new(ScriptedWorker::new("x-worker", &["x"])));
    });

    let options = fast_options()
        .with_max_retries(50)
        .with_retry_delay(Duration::from_millis(10));
    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();
    late.await.unwrap();

    assert_eq!(summary.status, SummaryStatus::Completed);
    assert_eq!(summary.tasks[0].worker, Some(WorkerId::from("x-worker")));
    assert!(summary.retries >= 1);
}

/// Test: Scenario E - timeout
/// Given a task that hangs past the execution timeout
/// When monitoring notices the bound
/// Then the task is failed with reason "timeout" and the run completes
#[tokio::test]
async fn test_timeout_fails_in_flight_task() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).with_delay(Duration::from_secs(30)));
    let harness = Harness::new(vec![worker]);
    let plan = harness.plan("slow");
    let task = harness.add(&plan, Task::new("hang", "hang"));

    let started = std::time::Instant::now();
    let summary = harness
        .orchestrator
        .execute_plan(plan.id, fast_options().with_timeout(Duration::from_millis(100)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(summary.timed_out);
    assert_eq!(summary.status, SummaryStatus::Error);
    assert_eq!(summary.retries, 0);
    assert!(summary.error.as_deref().is_some_and(|e| e.contains("timed out")));
    assert_eq!(summary.phases.last(), Some(&Phase::Completion));
    let task = harness.store.get_task(&plan.id, &task).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_reason.as_deref(), Some("timeout"));
}

/// Test: Timeout during a sequential wave
/// Given two slow independent tasks run one at a time
/// When the overall timeout fires during whichever runs first
/// Then that task fails with "timeout" and the other never starts
#[tokio::test]
async fn test_timeout_stops_sequential_wave() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).with_delay(Duration::from_secs(30)));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("slow");
    harness.add(&plan, Task::new("first", "first"));
    harness.add(&plan, Task::new("second", "second"));

    let summary = harness
        .orchestrator
        .execute_plan(
            plan.id,
            fast_options()
                .with_strategy(StrategyKind::Sequential)
                .with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert!(summary.timed_out);
    let log = worker.log();
    assert_eq!(log.len(), 1);
    let ran = summary.task(&log[0]).unwrap();
    assert_eq!(ran.status, TaskStatus::Failed);
    assert_eq!(ran.failure_reason.as_deref(), Some("timeout"));
    let idle = if log[0] == "first" { "second" } else { "first" };
    let idle = summary.task(idle).unwrap();
    assert_eq!(idle.status, TaskStatus::Pending);
    assert_eq!(idle.attempts, 0);
}

/// Test: External cancellation
/// Given two slow tasks running in parallel
/// When the plan is cancelled
/// Then every unfinished task fails with "cancelled" and nothing is retried
#[tokio::test]
async fn test_cancel_fails_unfinished_tasks() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).with_delay(Duration::from_secs(30)));
    let harness = Harness::new(vec![worker]);
    let plan = harness.plan("cancel");
    harness.add(&plan, Task::new("one", "one"));
    harness.add(&plan, Task::new("two", "two"));

    let orchestrator = Arc::clone(&harness.orchestrator);
    let plan_id = plan.id;
    let run = tokio::spawn(async move {
        orchestrator
            .execute_plan(plan_id, fast_options().with_strategy(StrategyKind::Parallel))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.orchestrator.is_running(&plan.id));
    assert!(harness.orchestrator.cancel(&plan.id));

    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.status, SummaryStatus::Cancelled);
    assert!(summary.cancelled);
    assert_eq!(summary.retries, 0);
    assert_eq!(summary.failed, 2);
    assert!(summary
        .tasks
        .iter()
        .all(|t| t.failure_reason.as_deref() == Some("cancelled")));
    assert!(!harness.orchestrator.is_running(&plan.id));
}

/// Test: Caller-supplied cancellation token
/// Given a token cancelled before the run starts
/// When the plan executes
/// Then no worker is called
#[tokio::test]
async fn test_pre_cancelled_token_runs_nothing() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("never");
    harness.add(&plan, Task::new("t", "t"));
    let token = CancellationToken::new();
    token.cancel();

    let summary = harness
        .orchestrator
        .execute_plan(plan.id, fast_options().with_cancel_token(token))
        .await
        .unwrap();

    assert_eq!(summary.status, SummaryStatus::Cancelled);
    assert_eq!(worker.calls(), 0);
    assert_eq!(summary.tasks[0].status, TaskStatus::Failed);
}

/// Test: Parallel limit
/// Given 4 independent tasks and a limit of 2
/// When the parallel strategy runs
/// Then at most 2 execute at once
#[tokio::test]
async fn test_parallel_limit_bounds_concurrency() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).with_delay(Duration::from_millis(30)));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("bounded");
    let options = fast_options()
        .with_strategy(StrategyKind::Parallel)
        .with_parallel_limit(2)
        .with_tasks((0..4).map(|i| draft(&format!("t{}", i))).collect());

    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();

    assert_eq!(summary.completed, 4);
    assert_eq!(worker.max_active(), 2);
}

/// Test: Parallel failure isolation
/// Given three parallel tasks where one fails
/// When the wave runs
/// Then the siblings still complete
#[tokio::test]
async fn test_parallel_failure_does_not_abort_siblings() {
    let worker = Arc::new(
        ScriptedWorker::new("w", &[])
            .with_delay(Duration::from_millis(20))
            .failing("bad", 1),
    );
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("isolated");
    let options = fast_options()
        .with_strategy(StrategyKind::Parallel)
        .with_max_retries(0)
        .with_tasks(vec![draft("good-1"), draft("bad"), draft("good-2")]);

    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();

    assert_eq!(summary.status, SummaryStatus::Partial);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(worker.calls(), 3);
}

/// Test: Execution waves
/// Given B depending on A under the parallel strategy
/// When the first wave only manages A
/// Then a second wave runs B without consuming a retry
#[tokio::test]
async fn test_dependents_run_in_a_later_wave() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).with_delay(Duration::from_millis(20)));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("waves");
    let options = fast_options()
        .with_strategy(StrategyKind::Parallel)
        .with_tasks(vec![draft("A"), draft("B").depends_on(&["A"])]);

    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();

    assert_eq!(summary.status, SummaryStatus::Completed);
    assert_eq!(summary.retries, 0);
    assert_eq!(worker.log(), vec!["A", "B"]);
    let delegations = summary.phases.iter().filter(|p| **p == Phase::Delegation).count();
    assert_eq!(delegations, 2);
}

/// Test: Capability-based routing
/// Given two workers with different capabilities
/// When tasks require one or the other
/// Then each task goes to the matching worker
#[tokio::test]
async fn test_tasks_route_by_capability() {
    let rust = Arc::new(ScriptedWorker::new("rust", &["rust"]));
    let docs = Arc::new(ScriptedWorker::new("docs", &["markdown"]).with_priority(5));
    let harness = Harness::new(vec![Arc::clone(&rust), Arc::clone(&docs)]);
    let plan = harness.plan("route");
    let options = fast_options().with_tasks(vec![
        draft("compile").with_capabilities(&["rust"]),
        draft("readme").with_capabilities(&["markdown"]),
        draft("anything"),
    ]);

    let summary = harness.orchestrator.execute_plan(plan.id, options).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.task("compile").unwrap().worker, Some(WorkerId::from("rust")));
    assert_eq!(summary.task("readme").unwrap().worker, Some(WorkerId::from("docs")));
    // No requirements: priority decides.
    assert_eq!(summary.task("anything").unwrap().worker, Some(WorkerId::from("docs")));
}

/// Test: Planner fallback
/// Given planners that return nothing or fail
/// When the plan executes
/// Then a single fallback task wrapping the plan description runs
#[tokio::test]
async fn test_planner_fallback_single_task() {
    for planner in [
        Arc::new(EmptyPlanner) as conductor::SharedPlanner,
        Arc::new(FailingPlanner) as conductor::SharedPlanner,
    ] {
        let worker = Arc::new(ScriptedWorker::new("w", &[]));
        let store = Arc::new(TaskStore::default());
        let orchestrator = Orchestrator::new(store, Arc::new(CapabilityRegistry::new()))
            .with_workers([Arc::clone(&worker) as SharedWorker])
            .with_planner(planner);
        let harness = Harness::from_orchestrator(orchestrator);
        let plan = harness.plan("fallback");

        let summary = harness.orchestrator.execute_plan(plan.id, fast_options()).await.unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.total, 1);
        assert_eq!(worker.log(), vec!["fallback goal"]);
    }
}

/// Test: Planner output with nesting and bad references
/// Given drafts with subtasks, an unknown dependency and a duplicate name
/// When planning converts them
/// Then the usable structure survives and everything runs
#[tokio::test]
async fn test_planner_drafts_with_subtasks() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]));
    let planner = StaticPlanner::new(vec![
        draft("setup"),
        draft("build")
            .depends_on(&["setup", "missing"])
            .with_subtasks(vec![draft("compile"), draft("link").depends_on(&["compile"])]),
        draft("setup"),
    ]);
    let store = Arc::new(TaskStore::default());
    let orchestrator = Orchestrator::new(store, Arc::new(CapabilityRegistry::new()))
        .with_workers([Arc::clone(&worker) as SharedWorker])
        .with_planner(Arc::new(planner));
    let harness = Harness::from_orchestrator(orchestrator);
    let plan = harness.plan("nested");

    let summary = harness.orchestrator.execute_plan(plan.id, fast_options()).await.unwrap();

    assert!(summary.is_success());
    // Leaves: setup, compile, link, setup (duplicate); build is a parent.
    assert_eq!(summary.total, 4);
    let log = worker.log();
    let pos = |name: &str| log.iter().position(|d| d == name).unwrap();
    assert!(pos("setup") < pos("compile"));
    assert!(pos("compile") < pos("link"));
    let plan = harness.store.get_plan(&plan.id).unwrap();
    assert_eq!(plan.task_by_name("build").unwrap().status, TaskStatus::Completed);
}

/// Test: Tasks added beside the goal root
/// Given a plan whose only task was added without a parent
/// When the plan executes
/// Then only that task runs and the goal root is neither run nor counted
#[tokio::test]
async fn test_parentless_task_runs_alone() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("p");
    harness
        .store
        .add_task(&plan.id, Task::new("only", "only"))
        .unwrap();

    let summary = harness.orchestrator.execute_plan(plan.id, fast_options()).await.unwrap();

    assert_eq!(worker.log(), vec!["only"]);
    assert_eq!(summary.total, 1);
    assert_eq!(summary.status, SummaryStatus::Completed);
    assert_eq!(summary.plan_status, TaskStatus::Completed);
    assert!(summary.task("p").is_none());
}

/// Test: Plan completion event
/// Given a successful run
/// When it finishes
/// Then plan_completed is the last event and carries the outcome
#[tokio::test]
async fn test_plan_completed_event_is_last() {
    let harness = Harness::new(vec![Arc::new(ScriptedWorker::new("w", &[]))]);
    let plan = harness.plan("events");
    harness.add(&plan, Task::new("t", "t"));

    harness.orchestrator.execute_plan(plan.id, fast_options()).await.unwrap();

    let events = harness.events();
    match events.last() {
        Some(Event::PlanCompleted { plan_id, status, outcome }) => {
            assert_eq!(*plan_id, plan.id);
            assert_eq!(*status, TaskStatus::Completed);
            assert_eq!(outcome, "completed");
        }
        other => panic!("unexpected last event {:?}", other),
    }
    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e {
            Event::PhaseChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(phases.first(), Some(&Phase::Delegation));
    assert_eq!(phases.last(), Some(&Phase::Completion));
}

/// Test: Concurrent execution of one plan
/// Given a plan that is already executing
/// When a second execution starts
/// Then it is rejected
#[tokio::test]
async fn test_second_execution_of_same_plan_rejected() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).with_delay(Duration::from_millis(200)));
    let harness = Harness::new(vec![worker]);
    let plan = harness.plan("busy");
    harness.add(&plan, Task::new("t", "t"));

    let orchestrator = Arc::clone(&harness.orchestrator);
    let plan_id = plan.id;
    let first =
        tokio::spawn(async move { orchestrator.execute_plan(plan_id, fast_options()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = harness.orchestrator.execute_plan(plan.id, fast_options()).await;
    assert!(matches!(second, Err(Error::Validation(_))));
    assert!(first.await.unwrap().unwrap().is_success());
}

/// Test: Missing plan
/// Given an unknown plan id
/// When execution is requested
/// Then NotFound is returned instead of a summary
#[tokio::test]
async fn test_missing_plan_is_not_found() {
    let harness = Harness::new(Vec::new());
    let err = harness
        .orchestrator
        .execute_plan(conductor::PlanId::new(), fast_options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

/// Test: Direct execution after failure
/// Given a task left failed by a run without retries
/// When it is executed directly
/// Then it is reset, re-run and completed
#[tokio::test]
async fn test_execute_task_directly_retries_failed_task() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]).failing("once", 1));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("direct");
    let task = harness.add(&plan, Task::new("once", "once"));

    let summary = harness
        .orchestrator
        .execute_plan(plan.id, fast_options().with_max_retries(0))
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let report = harness
        .orchestrator
        .execute_task_directly(plan.id, task, fast_options())
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.attempts, 2);
    assert_eq!(
        harness.store.get_plan(&plan.id).unwrap().status,
        TaskStatus::Completed
    );
}

/// Test: Direct execution guards
/// Given a completed task and a task with an unfinished dependency
/// When each is executed directly
/// Then both are rejected without running a worker
#[tokio::test]
async fn test_execute_task_directly_rejects_unrunnable_tasks() {
    let worker = Arc::new(ScriptedWorker::new("w", &[]));
    let harness = Harness::new(vec![Arc::clone(&worker)]);
    let plan = harness.plan("guards");
    let done = harness.add(&plan, Task::new("done", "done"));
    let blocked = harness.add(&plan, Task::new("blocked", "blocked").with_dependencies([done]));
    let waiting = harness.add(&plan, Task::new("waiting", "waiting").with_dependencies([blocked]));
    harness
        .store
        .update_task_status(&plan.id, &done, TaskUpdate::started(None))
        .unwrap();
    harness
        .store
        .update_task_status(&plan.id, &done, TaskUpdate::completed(serde_json::json!("ok")))
        .unwrap();

    let completed = harness
        .orchestrator
        .execute_task_directly(plan.id, done, fast_options())
        .await;
    let early = harness
        .orchestrator
        .execute_task_directly(plan.id, waiting, fast_options())
        .await;

    assert!(matches!(completed, Err(Error::Validation(_))));
    assert!(matches!(early, Err(Error::Validation(_))));
    assert_eq!(worker.calls(), 0);
}
