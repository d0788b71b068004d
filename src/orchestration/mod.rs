//! Orchestration layer.
//!
//! Assignment, execution strategies, the phase machine, and the
//! orchestrator that ties them to the task store.

pub mod assign;
pub mod orchestrator;
pub mod phase;
pub mod strategy;
pub mod summary;

pub use assign::{AssignmentResolver, CapabilityMatch};
pub use orchestrator::{tasks_from_drafts, ExecutionOptions, Orchestrator};
pub use phase::{Phase, PhaseController};
pub use strategy::{Strategy, StrategyKind, TaskOutcome, TaskRunner};
pub use summary::{ExecutionSummary, SummaryStatus, TaskReport};
