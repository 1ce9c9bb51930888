// ABOUTME: Shared types and configuration for corral.
// ABOUTME: Contains config parsing, worker definitions, and the bounded log sink.

pub mod config;
pub mod error;
pub mod logbuf;
pub mod worker;

pub use config::{Config, GatewaySettings, SupervisorSettings};
pub use error::ConfigError;
pub use logbuf::{LineRing, LogBuffer, LogEntry, LogLevel, LogSink, SUPERVISOR_SOURCE};
pub use worker::{WorkerConfig, WorkerSnapshot, WorkerStatus, RESERVED_WORKER_NAMES};
