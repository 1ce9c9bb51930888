// ABOUTME: Worker launch configuration, lifecycle status, and status snapshots.
// ABOUTME: WorkerConfig is immutable once registered; snapshots are plain copies.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Names that collide with gateway routes (`/process/multi`).
pub const RESERVED_WORKER_NAMES: &[&str] = &["multi"];

/// Launch configuration for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Unique key within a supervisor
    pub name: String,

    /// Executable followed by its arguments
    pub command: Vec<String>,

    /// Loopback port the worker listens on
    pub port: u16,

    /// Host used to reach the worker
    #[serde(default = "default_host")]
    pub host: String,

    /// Readiness endpoint, answered with 200 once the worker is up
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Extra environment variables merged into the inherited environment
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Environment variable that receives `port` at spawn time (e.g. "GO_PORT")
    #[serde(default)]
    pub port_env: Option<String>,

    /// Working directory for the child process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl WorkerConfig {
    pub fn new<I, S>(name: impl Into<String>, command: I, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            port,
            host: default_host(),
            health_path: default_health_path(),
            environment: BTreeMap::new(),
            port_env: None,
            working_dir: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_port_env(mut self, var: impl Into<String>) -> Self {
        self.port_env = Some(var.into());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// URL for `path` on this worker, e.g. `http://localhost:8001/process`
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://{}:{}{}", self.host, self.port, path)
        } else {
            format!("http://{}:{}/{}", self.host, self.port, path)
        }
    }

    pub fn health_url(&self) -> String {
        self.url(&self.health_path)
    }

    /// Variables added on top of the supervisor's environment at spawn.
    pub fn spawn_env(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(ref var) = self.port_env {
            vars.retain(|(k, _)| k != var);
            vars.push((var.clone(), self.port.to_string()));
        }
        vars
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidWorker {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.name.contains('/') {
            return Err(invalid("name must not contain '/'"));
        }
        if RESERVED_WORKER_NAMES.contains(&self.name.as_str()) {
            return Err(invalid("name is reserved by the gateway"));
        }
        if self.program().map_or(true, |p| p.trim().is_empty()) {
            return Err(invalid("command is empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        if !self.health_path.starts_with('/') {
            return Err(invalid("health_path must start with '/'"));
        }
        if self.port_env.as_deref().is_some_and(str::is_empty) {
            return Err(invalid("port_env is empty"));
        }
        Ok(())
    }
}

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of one worker's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSnapshot {
    pub name: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_logs: Vec<String>,
}

impl WorkerSnapshot {
    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }
}
