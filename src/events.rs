//! Event bus for task and phase transitions.
//!
//! Subscribers register a callback and an optional set of event kinds.
//! Events are delivered synchronously, in the order they were raised.
//! Nothing is persisted; a new bus starts with no history.
//!
//! Producers enqueue while holding whatever lock orders their writes (the
//! store enqueues under the plan lock), then call [`EventBus::flush`] after
//! releasing it. Exactly one thread drains the queue at a time, so
//! callbacks never run concurrently with each other and may freely read
//! the store or publish further events. A flush from any other thread waits
//! for the drain in progress, so once it returns the caller's own events
//! have been delivered. Callbacks must not block on another publisher.

use crate::core::plan::PlanId;
use crate::core::task::{TaskId, TaskStatus};
use crate::orchestration::phase::Phase;
use crate::registry::WorkerId;
use crate::util;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::ThreadId;

/// Something that happened to a plan or one of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskStarted {
        plan_id: PlanId,
        task_id: TaskId,
        worker: Option<WorkerId>,
    },
    TaskCompleted {
        plan_id: PlanId,
        task_id: TaskId,
        result: Option<serde_json::Value>,
    },
    TaskFailed {
        plan_id: PlanId,
        task_id: TaskId,
        reason: String,
    },
    /// Raised for leaves and for every parent whose derived status moved.
    TaskStatusChanged {
        plan_id: PlanId,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Raised once per `execute_plan` run, with the overall outcome.
    PlanCompleted {
        plan_id: PlanId,
        status: TaskStatus,
        outcome: String,
    },
    PhaseChanged {
        plan_id: PlanId,
        from: Phase,
        to: Phase,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TaskStarted { .. } => EventKind::TaskStarted,
            Event::TaskCompleted { .. } => EventKind::TaskCompleted,
            Event::TaskFailed { .. } => EventKind::TaskFailed,
            Event::TaskStatusChanged { .. } => EventKind::TaskStatusChanged,
            Event::PlanCompleted { .. } => EventKind::PlanCompleted,
            Event::PhaseChanged { .. } => EventKind::PhaseChanged,
        }
    }

    pub fn plan_id(&self) -> PlanId {
        match self {
            Event::TaskStarted { plan_id, .. }
            | Event::TaskCompleted { plan_id, .. }
            | Event::TaskFailed { plan_id, .. }
            | Event::TaskStatusChanged { plan_id, .. }
            | Event::PlanCompleted { plan_id, .. }
            | Event::PhaseChanged { plan_id, .. } => *plan_id,
        }
    }

    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::TaskStarted { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskStatusChanged { task_id, .. } => Some(*task_id),
            Event::PlanCompleted { .. } | Event::PhaseChanged { .. } => None,
        }
    }
}

/// Event type used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskStatusChanged,
    PlanCompleted,
    PhaseChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskStatusChanged => "task_status_changed",
            EventKind::PlanCompleted => "plan_completed",
            EventKind::PhaseChanged => "phase_changed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kinds: Option<Vec<EventKind>>,
    callback: EventCallback,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<Event>>,
    delivering: Mutex<()>,
    drainer: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &util::read(&self.subscribers).len())
            .field("queued", &util::lock(&self.queue).len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for the given kinds, or for every kind when `None`.
    pub fn subscribe<F>(&self, callback: F, kinds: Option<&[EventKind]>) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        util::write(&self.subscribers).push(Subscription {
            id,
            kinds: kinds.map(|k| k.to_vec()),
            callback: Arc::new(callback),
        });
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = util::write(&self.subscribers);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        util::read(&self.subscribers).len()
    }

    /// Raise an event and deliver everything queued.
    pub fn publish(&self, event: Event) {
        self.enqueue(event);
        self.flush();
    }

    /// Queue an event without delivering it.
    pub(crate) fn enqueue(&self, event: Event) {
        util::lock(&self.queue).push_back(event);
    }

    /// Deliver queued events in order.
    ///
    /// Called from inside a callback, this returns at once and the drain
    /// already running on this thread delivers the events after the current
    /// one. On any other thread it waits for a running drain to finish, then
    /// drains whatever is left.
    pub fn flush(&self) {
        let me = std::thread::current().id();
        if *util::lock(&self.drainer) == Some(me) {
            return;
        }

        let _guard = util::lock(&self.delivering);
        *util::lock(&self.drainer) = Some(me);
        loop {
            let next = util::lock(&self.queue).pop_front();
            let Some(event) = next else { break };
            self.deliver(&event);
        }
        *util::lock(&self.drainer) = None;
    }

    fn deliver(&self, event: &Event) {
        let kind = event.kind();
        let targets: Vec<EventCallback> = util::read(&self.subscribers)
            .iter()
            .filter(|s| s.wants(kind))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in targets {
            callback(event);
        }
    }
}
