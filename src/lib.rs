pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod registry;
pub mod util;
pub mod worker;

pub use crate::core::{
    Plan, PlanContext, PlanId, Task, TaskDraft, TaskId, TaskStatus, TaskStore, TaskUpdate,
};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, SubscriptionId};
pub use orchestration::{
    ExecutionOptions, ExecutionSummary, Orchestrator, StrategyKind, SummaryStatus,
};
pub use registry::{CapabilityRegistry, WorkerDescriptor, WorkerId};
pub use worker::{Planner, SharedPlanner, SharedWorker, Worker};
