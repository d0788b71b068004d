use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::orchestration::{CapabilityMatch, StrategyKind};
use crate::{clog_debug, Error, Result};

/// Execution defaults, the `[execution]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub strategy: StrategyKind,
    /// Concurrency bound for parallel runs; unset means one slot per task.
    pub parallel_limit: Option<usize>,
    pub priority_threshold: i32,
    pub abort_on_failure: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub max_subtasks: usize,
    pub max_depth: usize,
    pub capability_match: CapabilityMatch,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Sequential,
            parallel_limit: None,
            priority_threshold: 5,
            abort_on_failure: false,
            timeout_secs: 600,
            max_retries: 3,
            retry_delay_ms: 1000,
            poll_interval_ms: 50,
            max_subtasks: 10,
            max_depth: 2,
            capability_match: CapabilityMatch::Exact,
        }
    }
}

/// A command worker, one `[[workers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: strategy={}, max_retries={}, workers={}",
            config.execution.strategy,
            config.execution.max_retries,
            config.workers.len()
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                clog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if exec.retry_delay_ms == 0 {
            return Err(Error::Validation(
                "execution.retry_delay_ms must be non-zero".to_string(),
            ));
        }
        if exec.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "execution.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if exec.parallel_limit == Some(0) {
            return Err(Error::Validation(
                "execution.parallel_limit must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() || worker.command.trim().is_empty() {
                return Err(Error::Validation(
                    "workers need a non-empty id and command".to_string(),
                ));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate worker id {}",
                    worker.id
                )));
            }
        }
        Ok(())
    }
}
