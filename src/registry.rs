//! Capability registry.
//!
//! Tracks which workers exist and what they declare they can do. It is a
//! pure in-memory index: nothing here executes work. Registration order is
//! preserved because the assignment resolver breaks score ties with it.

use crate::error::{Error, Result};
use crate::util;
use crate::{clog, clog_debug};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Identifier chosen by whoever registers the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered worker and its declared capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub capabilities: Vec<String>,
    /// Added to the capability score during assignment.
    pub priority: i32,
    /// Inactive workers stay registered but are never assigned work.
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

impl WorkerDescriptor {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// In-memory index of workers, in registration order.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    workers: RwLock<Vec<WorkerDescriptor>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker with priority 0.
    pub fn register<I, S>(&self, id: impl Into<WorkerId>, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_with_priority(id, capabilities, 0);
    }

    /// Register a worker, or replace the capabilities and priority of an
    /// existing one. Re-registration keeps the original position and
    /// re-activates the worker.
    pub fn register_with_priority<I, S>(
        &self,
        id: impl Into<WorkerId>,
        capabilities: I,
        priority: i32,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let mut caps: Vec<String> = Vec::new();
        for cap in capabilities {
            let cap = cap.into();
            if !cap.trim().is_empty() && !caps.contains(&cap) {
                caps.push(cap);
            }
        }

        let mut workers = util::write(&self.workers);
        if let Some(existing) = workers.iter_mut().find(|w| w.id == id) {
            clog_debug!("Registry: re-register worker {} caps={:?}", id, caps);
            existing.capabilities = caps;
            existing.priority = priority;
            existing.active = true;
            return;
        }

        clog!("Registry: register worker {} caps={:?} priority={}", id, caps, priority);
        workers.push(WorkerDescriptor {
            id,
            capabilities: caps,
            priority,
            active: true,
            registered_at: Utc::now(),
        });
    }

    /// Remove a worker. Returns whether it was registered.
    pub fn unregister(&self, id: &WorkerId) -> bool {
        let mut workers = util::write(&self.workers);
        let before = workers.len();
        workers.retain(|w| &w.id != id);
        let removed = workers.len() != before;
        if removed {
            clog!("Registry: unregister worker {}", id);
        }
        removed
    }

    /// All workers in registration order.
    pub fn list_workers(&self) -> Vec<WorkerDescriptor> {
        util::read(&self.workers).clone()
    }

    /// Ids of workers declaring exactly `capability`, in registration order.
    pub fn find_by_capability(&self, capability: &str) -> Vec<WorkerId> {
        util::read(&self.workers)
            .iter()
            .filter(|w| w.has_capability(capability))
            .map(|w| w.id.clone())
            .collect()
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerDescriptor> {
        util::read(&self.workers).iter().find(|w| &w.id == id).cloned()
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        util::read(&self.workers).iter().any(|w| &w.id == id)
    }

    pub fn is_active(&self, id: &WorkerId) -> bool {
        util::read(&self.workers)
            .iter()
            .any(|w| &w.id == id && w.active)
    }

    pub fn set_active(&self, id: &WorkerId, active: bool) -> Result<()> {
        let mut workers = util::write(&self.workers);
        let worker = workers
            .iter_mut()
            .find(|w| &w.id == id)
            .ok_or_else(|| Error::worker_not_found(id))?;
        worker.active = active;
        clog_debug!("Registry: worker {} active={}", id, active);
        Ok(())
    }

    pub fn len(&self) -> usize {
        util::read(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
