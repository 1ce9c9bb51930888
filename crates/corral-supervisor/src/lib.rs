// ABOUTME: corral process supervisor: worker table, readiness polling, and shutdown.
// ABOUTME: Re-exports the supervisor handle, health checker, and error types.

pub mod error;
pub mod health;
pub mod process;
pub mod supervisor;

pub use error::SupervisorError;
pub use health::{HealthChecker, ProbeOutcome};
pub use process::{ExitInfo, ProcessControl, WorkerProcess};
pub use supervisor::{ProcessSupervisor, StartReport, Unavailable};
