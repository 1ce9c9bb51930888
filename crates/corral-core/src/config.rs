// ABOUTME: Configuration for the corral supervisor, gateway, and workers.
// ABOUTME: Loaded from TOML with ${VAR} expansion, defaults, and env overrides.

use crate::error::ConfigError;
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Prefix for environment overrides (`CORRAL_<WORKER>_PORT`, ...)
pub const ENV_PREFIX: &str = "CORRAL_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway listen host
    #[serde(default = "default_host")]
    pub host: String,

    /// Gateway listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pause between starting consecutive workers
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_start_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Health probes before a start is declared a readiness timeout
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    #[serde(default = "default_readiness_interval_ms")]
    pub readiness_interval_ms: u64,

    /// Hard deadline for a single health probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Entries kept in the supervisor log ring
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Stop a worker that never became ready instead of leaving it registered
    #[serde(default)]
    pub stop_unready: bool,
}

fn default_readiness_attempts() -> u32 {
    30
}

fn default_readiness_interval_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_log_capacity() -> usize {
    500
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            log_capacity: default_log_capacity(),
            stop_unready: false,
        }
    }
}

impl SupervisorSettings {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Deadline for each proxied worker request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Log entries included in /status
    #[serde(default = "default_status_log_tail")]
    pub status_log_tail: usize,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_status_log_tail() -> usize {
    50
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            status_log_tail: default_status_log_tail(),
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            start_delay_ms: default_start_delay_ms(),
            supervisor: SupervisorSettings::default(),
            gateway: GatewaySettings::default(),
            workers: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, expanding `${VAR}` references.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate TOML text, expanding `${VAR}` references.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let contents = shellexpand::env_with_context_no_errors(contents, |var: &str| {
            match std::env::var(var) {
                Ok(val) => Some(val),
                Err(_) => {
                    warn!(
                        variable = %var,
                        "Environment variable not defined, using empty string"
                    );
                    Some(String::new())
                }
            }
        });

        let config: Config =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path (~/.config/corral/corral.toml)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("corral"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("corral.toml")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Reject duplicate names/ports and malformed workers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ports: HashMap<u16, &str> = HashMap::new();
        let mut names: Vec<&str> = Vec::new();

        for worker in &self.workers {
            worker.validate()?;
            if names.contains(&worker.name.as_str()) {
                return Err(ConfigError::DuplicateWorker(worker.name.clone()));
            }
            names.push(&worker.name);
            if let Some(first) = ports.insert(worker.port, &worker.name) {
                return Err(ConfigError::DuplicatePort {
                    port: worker.port,
                    first: first.to_string(),
                    second: worker.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Apply per-worker overrides from environment variables:
    /// `CORRAL_<WORKER>_PORT=<port>` and `CORRAL_<WORKER>_ENV_<VAR>=<value>`.
    ///
    /// Worker names map to keys by upper-casing and replacing `-` with `_`.
    /// When several worker keys prefix a variable, the longest one whose
    /// remainder is `PORT` or `ENV_<VAR>` wins, so `CORRAL_A_ENV_PORT` is the
    /// port of `a-env` rather than `PORT` for `a`.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut prefixes: Vec<(usize, String)> = self
            .workers
            .iter()
            .enumerate()
            .map(|(idx, w)| (idx, format!("{}{}_", ENV_PREFIX, env_key(&w.name))))
            .collect();
        prefixes.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        for (key, value) in vars {
            if !key.starts_with(ENV_PREFIX) {
                continue;
            }
            let Some((idx, target)) = prefixes.iter().find_map(|(idx, prefix)| {
                key.strip_prefix(prefix.as_str())
                    .and_then(EnvOverride::parse)
                    .map(|target| (*idx, target))
            }) else {
                continue;
            };

            let worker = &mut self.workers[idx];
            match target {
                EnvOverride::Port => {
                    worker.port = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                        var: key.clone(),
                        value: value.clone(),
                    })?;
                }
                EnvOverride::Env(name) => {
                    worker.environment.insert(name.to_string(), value);
                }
            }
        }

        self.validate()
    }
}

/// What a `CORRAL_<WORKER>_...` variable sets once the worker key is stripped.
enum EnvOverride<'a> {
    Port,
    Env(&'a str),
}

impl<'a> EnvOverride<'a> {
    fn parse(rest: &'a str) -> Option<Self> {
        if rest == "PORT" {
            return Some(Self::Port);
        }
        rest.strip_prefix("ENV_")
            .filter(|name| !name.is_empty())
            .map(Self::Env)
    }
}

/// Environment key for a worker name: `go-service` -> `GO_SERVICE`
pub fn env_key(worker_name: &str) -> String {
    worker_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
