//! Plan entity and the context bag passed through to workers.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Unique identifier for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    /// Create a new unique plan identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single value in a plan context.
///
/// Nested tables are rejected at the boundary; workers receive flat,
/// typed values only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<ContextValue>),
}

impl ContextValue {
    /// Render the value as plain text (lists are comma separated).
    pub fn as_text(&self) -> String {
        match self {
            ContextValue::Flag(b) => b.to_string(),
            ContextValue::Integer(i) => i.to_string(),
            ContextValue::Float(f) => f.to_string(),
            ContextValue::Text(s) => s.clone(),
            ContextValue::List(items) => items
                .iter()
                .map(ContextValue::as_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Text(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Text(s)
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        ContextValue::Integer(i)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Flag(b)
    }
}

/// Key/value bag passed through to workers untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanContext {
    entries: BTreeMap<String, ContextValue>,
}

impl PlanContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from arbitrary JSON, rejecting anything but a flat object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::Validation(
                "plan context must be a JSON object".to_string(),
            ));
        }
        let context: PlanContext = serde_json::from_value(value)?;
        context.validate()?;
        Ok(context)
    }

    pub fn with(mut self, key: &str, value: impl Into<ContextValue>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ContextValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.entries.iter()
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged(&self, other: &PlanContext) -> PlanContext {
        let mut entries = self.entries.clone();
        for (k, v) in &other.entries {
            entries.insert(k.clone(), v.clone());
        }
        PlanContext { entries }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(key) = self.entries.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "plan context key {:?} is empty",
                key
            )));
        }
        Ok(())
    }
}

/// A tree of tasks created from one goal.
///
/// `status` is derived from the root tasks and is only ever written by the
/// status propagator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub description: String,
    pub tasks: HashMap<TaskId, Task>,
    pub root_task_ids: Vec<TaskId>,
    pub status: TaskStatus,
    pub context: PlanContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub(crate) fn new(name: &str, description: &str, context: PlanContext) -> Self {
        let now = Utc::now();
        Self {
            id: PlanId::new(),
            name: name.to_string(),
            description: description.to_string(),
            tasks: HashMap::new(),
            root_task_ids: Vec::new(),
            status: TaskStatus::Pending,
            context,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Look a task up by name. Names are not unique; the oldest match wins.
    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.name == name)
            .min_by_key(|t| (t.created_at, t.id))
    }

    /// A task is ready iff it is pending and every dependency is completed.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        self.tasks.get(id).is_some_and(|task| {
            task.status == TaskStatus::Pending
                && task.dependencies_met(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
        })
    }

    /// True when some dependency of the task has failed in this attempt.
    pub fn is_blocked(&self, id: &TaskId) -> bool {
        self.tasks.get(id).is_some_and(|task| {
            task.dependencies.iter().any(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Failed)
            })
        })
    }

    /// True for the root created with the plan while other roots carry the
    /// work and it has neither children nor a start of its own.
    ///
    /// Such a root stands in for the goal only; it is never executed,
    /// counted, or consulted for the plan status.
    pub fn is_idle_goal_root(&self, id: &TaskId) -> bool {
        self.root_task_ids.len() > 1
            && self.root_task_ids.first() == Some(id)
            && self
                .tasks
                .get(id)
                .is_some_and(|t| t.is_leaf() && t.status == TaskStatus::Pending)
    }

    /// Roots whose status makes up the plan status.
    pub fn counted_roots(&self) -> impl Iterator<Item = &TaskId> {
        self.root_task_ids
            .iter()
            .filter(move |id| !self.is_idle_goal_root(id))
    }

    /// Leaf tasks are the ones executed by workers.
    pub fn leaf_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(move |t| t.is_leaf() && !self.is_idle_goal_root(&t.id))
    }

    pub fn count_leaves_with(&self, status: TaskStatus) -> usize {
        self.leaf_tasks().filter(|t| t.status == status).count()
    }

    /// Every leaf has reached a terminal state.
    pub fn all_leaves_terminal(&self) -> bool {
        self.leaf_tasks().all(|t| t.is_finished())
    }

    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
