//! Orchestrator phases and the controller that enforces their order.

use crate::clog;
use crate::core::plan::PlanId;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Phase of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Obtain tasks from the caller or the planner.
    Planning,
    /// Choose a worker for every unassigned ready leaf.
    Delegation,
    /// Start the strategy run for the assigned wave.
    Execution,
    /// Poll task statuses until something needs deciding.
    Monitoring,
    /// Decide between retrying failed tasks and giving up.
    FailureHandling,
    /// Summary computed; terminal.
    Completion,
    /// Unrecoverable; terminal.
    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completion | Phase::Error)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Planning => write!(f, "planning"),
            Phase::Delegation => write!(f, "delegation"),
            Phase::Execution => write!(f, "execution"),
            Phase::Monitoring => write!(f, "monitoring"),
            Phase::FailureHandling => write!(f, "failure_handling"),
            Phase::Completion => write!(f, "completion"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// Tracks the current phase of one execution and publishes every move.
///
/// Allowed moves:
/// - Planning -> Delegation
/// - Delegation -> Execution, or Completion when cancelled
/// - Execution -> Monitoring
/// - Monitoring -> Completion | FailureHandling | Delegation (next wave)
/// - FailureHandling -> Delegation (retry) | Completion (give up)
/// - any non-terminal phase -> Error
pub struct PhaseController {
    plan_id: PlanId,
    current: Phase,
    history: Vec<(Phase, Instant)>,
    events: Arc<EventBus>,
    created_at: Instant,
}

impl PhaseController {
    /// Start in `Planning`.
    pub fn new(plan_id: PlanId, events: Arc<EventBus>) -> Self {
        let now = Instant::now();
        Self {
            plan_id,
            current: Phase::Planning,
            history: vec![(Phase::Planning, now)],
            events,
            created_at: now,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Time spent in the current phase.
    pub fn elapsed(&self) -> Duration {
        self.history
            .last()
            .map(|(_, entered)| entered.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn total_elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Phases visited, in order.
    pub fn phases(&self) -> Vec<Phase> {
        self.history.iter().map(|(p, _)| *p).collect()
    }

    pub fn transition(&mut self, target: Phase) -> Result<()> {
        if !Self::can_transition(self.current, target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }

        let from = self.current;
        clog!(
            "Plan {}: phase {} -> {} (after {:?})",
            self.plan_id.short(),
            from,
            target,
            self.elapsed()
        );
        self.current = target;
        self.history.push((target, Instant::now()));
        self.events.publish(Event::PhaseChanged {
            plan_id: self.plan_id,
            from,
            to: target,
        });
        Ok(())
    }

    pub fn can_transition(from: Phase, to: Phase) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == Phase::Error {
            return true;
        }
        matches!(
            (from, to),
            (Phase::Planning, Phase::Delegation)
                | (Phase::Delegation, Phase::Execution)
                | (Phase::Delegation, Phase::Completion)
                | (Phase::Execution, Phase::Monitoring)
                | (Phase::Monitoring, Phase::Completion)
                | (Phase::Monitoring, Phase::FailureHandling)
                | (Phase::Monitoring, Phase::Delegation)
                | (Phase::FailureHandling, Phase::Delegation)
                | (Phase::FailureHandling, Phase::Completion)
        )
    }
}
