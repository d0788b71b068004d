use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("No eligible worker for task {task}")]
    NoEligibleWorker { task: String },

    #[error("Execution of task {task} failed: {reason}")]
    ExecutionFailure { task: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Invalid status transition for task {task}: {from} -> {to}")]
    InvalidStatusTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Status of task {task} is derived from its children")]
    DerivedStatus { task: String },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    pub fn plan_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "Plan",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "Task",
            id: id.to_string(),
        }
    }

    pub fn worker_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "Worker",
            id: id.to_string(),
        }
    }

    /// Structural misuse that callers of the mutating APIs must see immediately.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::InvalidDependency(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
