// ABOUTME: corral gateway: forwards client requests to supervised workers.
// ABOUTME: Exposes the dispatcher, status reporter, axum router, and server entrypoint.

pub mod dispatch;
pub mod error;
pub mod routes;
pub mod server;
pub mod status;

pub use dispatch::{FanOutReport, RequestGateway, TargetOutcome};
pub use error::{ApiError, DispatchError};
pub use routes::{router, AppState, WORKER_PROCESS_PATH};
pub use server::{run, serve, shutdown_signal};
pub use status::{StatusReport, StatusReporter};
