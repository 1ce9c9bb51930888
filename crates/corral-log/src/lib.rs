// ABOUTME: Shared logging setup for the corral orchestrator and its workers
// ABOUTME: init() for the orchestrator, init_for() for single-crate binaries like workers

use tracing_subscriber::EnvFilter;

/// Orchestrator logging to stderr. Default: INFO level, RUST_LOG override.
///
/// Uses `try_init` so a second call (tests, embedded use) is a no-op
/// instead of a panic.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Crate-filtered logging to stdout. Default: INFO for the named crate, WARN
/// for everything else. Worker binaries use this; the supervisor records
/// worker stdout at INFO and stderr at WARN.
pub fn init_for(crate_name: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(crate_name))
        .with_ansi(false)
        .try_init();
}

fn filter_for(crate_name: &str) -> EnvFilter {
    let directive = format!("{}=info", crate_name.replace('-', "_"));
    EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        )
}
