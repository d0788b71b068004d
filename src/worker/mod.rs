//! Contracts for the collaborators the orchestrator drives.
//!
//! A [`Worker`] turns a task description into an opaque result. A
//! [`Planner`] turns a goal into candidate task drafts. The orchestrator
//! never looks inside either; it only stores what they return.

pub mod command;

use crate::core::plan::PlanContext;
use crate::core::task::TaskDraft;
use crate::error::Result;
use crate::registry::WorkerId;
use async_trait::async_trait;
use std::sync::Arc;

pub use command::CommandWorker;

/// Executes task descriptions.
///
/// Errors returned from `execute` are recorded as the task's failure reason;
/// they never abort the plan.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    fn capabilities(&self) -> Vec<String>;

    /// Added to the capability score when several workers qualify.
    fn priority(&self) -> i32 {
        0
    }

    async fn execute(&self, description: &str, context: &PlanContext) -> Result<serde_json::Value>;
}

pub type SharedWorker = Arc<dyn Worker>;

/// Decomposes a goal into task drafts.
///
/// Output may be empty, malformed, or reference names that do not exist;
/// the orchestrator degrades to a single fallback task in that case.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn decompose(
        &self,
        goal: &str,
        context: &PlanContext,
        max_subtasks: usize,
        max_depth: usize,
    ) -> Result<Vec<TaskDraft>>;
}

pub type SharedPlanner = Arc<dyn Planner>;

/// Planner that always returns the same drafts. Used for plan files whose
/// tasks are written out by hand.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    drafts: Vec<TaskDraft>,
}

impl StaticPlanner {
    pub fn new(drafts: Vec<TaskDraft>) -> Self {
        Self { drafts }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn decompose(
        &self,
        _goal: &str,
        _context: &PlanContext,
        max_subtasks: usize,
        _max_depth: usize,
    ) -> Result<Vec<TaskDraft>> {
        Ok(self.drafts.iter().take(max_subtasks).cloned().collect())
    }
}
