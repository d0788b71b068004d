//! Assignment resolver.
//!
//! Picks one worker for a task from a list of registered workers:
//! 1. a preferred worker that is listed and active wins outright;
//! 2. otherwise active workers covering every required capability are
//!    scored `10 * matching + priority`;
//! 3. the highest score wins and ties go to the earliest registration.
//!
//! `matching` counts the worker's declared capabilities that satisfy at
//! least one requirement, so a worker whose whole skill set is relevant
//! beats a generalist with the same priority.

use crate::clog_warn;
use crate::core::task::Task;
use crate::registry::{CapabilityRegistry, WorkerDescriptor, WorkerId};
use serde::{Deserialize, Serialize};

const CAPABILITY_WEIGHT: i64 = 10;

/// How a declared capability is compared to a required one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityMatch {
    /// Byte-for-byte equality.
    #[default]
    Exact,
    /// The requirement appears inside the declared capability, ignoring case.
    /// `"code"` is satisfied by `"Code-Review"`, not the other way round.
    Substring,
}

impl CapabilityMatch {
    pub fn satisfies(&self, declared: &str, required: &str) -> bool {
        match self {
            CapabilityMatch::Exact => declared == required,
            CapabilityMatch::Substring => declared
                .to_lowercase()
                .contains(&required.to_lowercase()),
        }
    }
}

impl std::str::FromStr for CapabilityMatch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(CapabilityMatch::Exact),
            "substring" => Ok(CapabilityMatch::Substring),
            other => Err(format!("unknown capability match mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssignmentResolver {
    mode: CapabilityMatch,
}

impl AssignmentResolver {
    pub fn new(mode: CapabilityMatch) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> CapabilityMatch {
        self.mode
    }

    /// Does `worker` cover every capability `task` requires?
    pub fn is_eligible(&self, task: &Task, worker: &WorkerDescriptor) -> bool {
        worker.active
            && task.required_capabilities.iter().all(|required| {
                worker
                    .capabilities
                    .iter()
                    .any(|declared| self.mode.satisfies(declared, required))
            })
    }

    /// Score of an eligible worker.
    pub fn score(&self, task: &Task, worker: &WorkerDescriptor) -> i64 {
        let matching = worker
            .capabilities
            .iter()
            .filter(|declared| {
                task.required_capabilities
                    .iter()
                    .any(|required| self.mode.satisfies(declared, required))
            })
            .count() as i64;
        CAPABILITY_WEIGHT * matching + worker.priority as i64
    }

    /// Choose a worker from `workers`, which must be in registration order.
    pub fn resolve(
        &self,
        task: &Task,
        workers: &[WorkerDescriptor],
        preferred: Option<&WorkerId>,
    ) -> Option<WorkerId> {
        if let Some(preferred) = preferred {
            if workers.iter().any(|w| &w.id == preferred && w.active) {
                return Some(preferred.clone());
            }
        }

        let mut best: Option<(&WorkerDescriptor, i64)> = None;
        for worker in workers.iter().filter(|w| self.is_eligible(task, w)) {
            let score = self.score(task, worker);
            // Strictly greater keeps the earlier registration on ties.
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((worker, score));
            }
        }

        match best {
            Some((worker, _)) => Some(worker.id.clone()),
            None => {
                clog_warn!(
                    "Assign: no eligible worker for task {} ({}) requiring {:?}",
                    task.id.short(),
                    task.name,
                    task.required_capabilities
                );
                None
            }
        }
    }

    /// Resolve against everything currently in `registry`.
    pub fn assign(
        &self,
        task: &Task,
        registry: &CapabilityRegistry,
        preferred: Option<&WorkerId>,
    ) -> Option<WorkerId> {
        self.resolve(task, &registry.list_workers(), preferred)
    }
}
