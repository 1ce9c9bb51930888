// ABOUTME: Error types for corral configuration and worker registration
// ABOUTME: Shared by the config loader and the supervisor's register path

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid worker '{name}': {reason}")]
    InvalidWorker { name: String, reason: String },

    #[error("Duplicate worker name: {0}")]
    DuplicateWorker(String),

    #[error("Port {port} is used by both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
}
