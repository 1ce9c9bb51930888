// ABOUTME: Error types for supervisor operations
// ABOUTME: Registration, spawn, and readiness failures surfaced to callers

use corral_core::{ConfigError, WorkerStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Worker '{name}' is already {status}")]
    AlreadyActive { name: String, status: WorkerStatus },

    #[error("Failed to spawn worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker '{name}' not ready after {attempts} attempts: {last_reason}")]
    ReadinessTimeout {
        name: String,
        attempts: u32,
        last_reason: String,
    },

    #[error("Worker '{name}' exited or was stopped before becoming ready")]
    ExitedBeforeReady { name: String, attempts: u32 },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl SupervisorError {
    /// Stable machine-readable code for API payloads
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownWorker(_) => "worker_not_found",
            Self::Config(_) => "invalid_config",
            Self::AlreadyActive { .. } => "already_active",
            Self::Spawn { .. } => "spawn_error",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::ExitedBeforeReady { .. } => "exited_before_ready",
            Self::Client(_) => "client_error",
        }
    }
}
