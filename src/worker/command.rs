//! Shell command worker.
//!
//! Runs a configured command through `sh -c`. The task description is
//! written to the child's stdin and every plan context entry is exported as
//! `CONDUCTOR_CTX_<KEY>`. Standard output becomes the task result: parsed
//! as JSON when possible, otherwise kept as trimmed text. A non-zero exit
//! is a failure whose reason is the trimmed standard error.

use crate::core::plan::PlanContext;
use crate::error::{Error, Result};
use crate::registry::WorkerId;
use crate::worker::Worker;
use crate::{clog_debug, clog_warn};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default per-invocation timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

const ENV_PREFIX: &str = "CONDUCTOR_CTX_";

#[derive(Debug, Clone)]
pub struct CommandWorker {
    id: WorkerId,
    capabilities: Vec<String>,
    priority: i32,
    command: String,
    shell: PathBuf,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandWorker {
    pub fn new(id: impl Into<WorkerId>, command: &str, capabilities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            priority: 0,
            command: command.to_string(),
            shell: PathBuf::from("sh"),
            cwd: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Program the command starts with.
    pub fn program(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }

    /// Check whether the program is on `PATH` (or is an existing path).
    pub fn is_available(&self) -> bool {
        self.program()
            .is_some_and(|program| which::which(program).is_ok())
    }

    /// Environment variable name for a context key.
    pub fn env_key(key: &str) -> String {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", ENV_PREFIX, sanitized)
    }

    /// Turn captured stdout into a result value.
    pub fn parse_output(stdout: &str) -> serde_json::Value {
        let trimmed = stdout.trim();
        serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn execute(&self, description: &str, context: &PlanContext) -> Result<serde_json::Value> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in context.iter() {
            cmd.env(Self::env_key(key), value.as_text());
        }

        clog_debug!("CommandWorker {}: spawning `{}`", self.id, self.command);
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        // Feed stdin while draining stdout, or a command that echoes its input
        // fills the output pipe and both sides block.
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A command that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(description.as_bytes()).await {
                    clog_debug!("CommandWorker {}: stdin write failed: {}", self.id, e);
                }
            }
        };
        let exchange = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let reason = if stderr.trim().is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            clog_warn!("CommandWorker {}: failed: {}", self.id, reason);
            return Err(Error::ExecutionFailure {
                task: description.lines().next().unwrap_or_default().to_string(),
                reason,
            });
        }

        Ok(Self::parse_output(&stdout))
    }
}
