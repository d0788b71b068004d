//! Task data model for plan execution.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, dependencies, assignment, position in the plan tree, and
//! the opaque result or failure reason of its last attempt.

use crate::error::{Error, Result};
use crate::registry::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for a task within a plan.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// Within one execution attempt a task only moves forward:
/// `Pending -> InProgress -> {Completed, Failed}`. The only backwards edge
/// is the explicit retry reset `Failed -> Pending`. A task that never
/// started may be failed directly (cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies, assignment, or dispatch.
    #[default]
    Pending,
    /// A worker is executing the task.
    InProgress,
    /// The worker returned a result.
    Completed,
    /// The worker returned an error, or the task was timed out/cancelled.
    Failed,
}

impl TaskStatus {
    /// Completed and Failed are terminal for an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Check whether `self -> target` is a legal transition.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single task in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Description handed to the worker.
    pub description: String,
    /// Current execution status.
    pub status: TaskStatus,
    /// Higher is more urgent.
    pub priority: i32,
    /// Tasks in the same plan that must complete first.
    pub dependencies: BTreeSet<TaskId>,
    /// Capabilities a worker must declare to be eligible.
    pub required_capabilities: BTreeSet<String>,
    /// Worker chosen by the assignment resolver.
    pub assigned_worker: Option<WorkerId>,
    /// Parent task in the plan tree.
    pub parent_id: Option<TaskId>,
    /// Child tasks; a task with children has a derived status.
    pub children: Vec<TaskId>,
    /// Opaque payload returned by the worker.
    pub result: Option<serde_json::Value>,
    /// Why the last attempt failed.
    pub failure_reason: Option<String>,
    /// Number of times the task entered `InProgress`.
    pub attempts: u32,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation; never moves backwards.
    pub updated_at: DateTime<Utc>,
    /// When the current attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the current attempt reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with the given name and description.
    pub fn new(name: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            assigned_worker: None,
            parent_id: None,
            children: Vec::new(),
            result: None,
            failure_reason: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I: IntoIterator<Item = TaskId>>(mut self, deps: I) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// A task with no children is executed by a worker.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bump `updated_at`, keeping it monotonic even if the wall clock steps back.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Move to `target`, enforcing the lifecycle rules.
    ///
    /// Entering `InProgress` counts an attempt; entering `Pending` (retry)
    /// clears the previous attempt's outcome and assignment.
    pub fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStatusTransition {
                task: self.id.to_string(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        match target {
            TaskStatus::InProgress => {
                self.attempts += 1;
                self.started_at = Some(Utc::now());
                self.completed_at = None;
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending => {
                self.result = None;
                self.failure_reason = None;
                self.assigned_worker = None;
                self.started_at = None;
                self.completed_at = None;
            }
        }
        self.status = target;
        self.touch();
        Ok(())
    }

    /// Check if all dependencies satisfy `is_completed`.
    pub fn dependencies_met<F: Fn(&TaskId) -> bool>(&self, is_completed: F) -> bool {
        self.dependencies.iter().all(is_completed)
    }
}

/// A candidate task produced by a planner or read from a plan file.
///
/// Dependencies are given by name and resolved to ids once every draft in
/// the batch has been created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub estimated_priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<TaskDraft>,
}

impl TaskDraft {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.estimated_priority = priority;
        self
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.required_capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.dependencies = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_subtasks(mut self, subtasks: Vec<TaskDraft>) -> Self {
        self.subtasks = subtasks;
        self
    }

    /// Description handed to workers; falls back to the name when empty.
    pub fn effective_description(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.name
        } else {
            &self.description
        }
    }
}
