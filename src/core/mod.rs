//! Core domain models for plan orchestration.
//!
//! Tasks, plans, the status propagator, and the store that owns them.

pub mod plan;
pub mod propagate;
pub mod store;
pub mod task;

pub use plan::{ContextValue, Plan, PlanContext, PlanId};
pub use propagate::{derive_status, propagate, Propagation, StatusChange};
pub use store::{TaskStore, TaskUpdate};
pub use task::{Task, TaskDraft, TaskId, TaskStatus};
