// ABOUTME: Gateway server lifecycle: bind, start workers, serve, and shut down.
// ABOUTME: Workers are stopped after the HTTP server drains on SIGINT/SIGTERM.

use crate::routes::{router, AppState};
use anyhow::{Context, Result};
use corral_core::Config;
use corral_supervisor::ProcessSupervisor;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

/// How often `/status` memory figures are refreshed
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Run the gateway until a shutdown signal arrives, then stop every worker.
pub async fn run(config: Config) -> Result<()> {
    let supervisor =
        ProcessSupervisor::with_workers(config.supervisor.clone(), config.workers.clone())
            .context("registering workers")?;
    let state = AppState::new(supervisor.clone(), &config.gateway)
        .context("building upstream HTTP client")?;
    let sampler = state.reporter.spawn_memory_sampler(MEMORY_SAMPLE_INTERVAL);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(
        addr = %addr,
        workers = config.workers.len(),
        "corral gateway listening"
    );

    let starter = {
        let supervisor = supervisor.clone();
        let delay = config.start_delay();
        tokio::spawn(async move {
            let results = supervisor.start_all(delay).await;
            let ready = results.iter().filter(|(_, r)| r.is_ok()).count();
            info!(ready, total = results.len(), "Worker startup finished");
        })
    };

    let served = serve(listener, state, shutdown_signal()).await;

    starter.abort();
    sampler.abort();
    let stopped = supervisor.shutdown_all().await;
    info!(count = stopped.len(), "Workers stopped");

    served.context("running HTTP server")
}

/// Serve the gateway router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
