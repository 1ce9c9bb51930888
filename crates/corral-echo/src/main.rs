// ABOUTME: Reference corral worker: answers /health and echoes POST /process bodies.
// ABOUTME: Reads its port from PORT (or --port), as the supervisor injects it at spawn.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "corral-echo")]
#[command(about = "Echo worker for the corral process orchestrator", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: u16,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1", env = "ECHO_HOST")]
    host: String,

    /// Name reported in /health and /status
    #[arg(long, default_value = "echo", env = "ECHO_NAME")]
    name: String,

    /// Artificial delay before answering /process
    #[arg(long, default_value_t = 0, env = "ECHO_DELAY_MS")]
    delay_ms: u64,
}

struct Echo {
    name: String,
    delay: Duration,
    started: Instant,
    processed: AtomicU64,
}

async fn health(State(echo): State<Arc<Echo>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "worker": echo.name,
    }))
}

/// Returns the request body unchanged; an empty body echoes `{}`.
async fn process(State(echo): State<Arc<Echo>>, body: Bytes) -> (StatusCode, Json<Value>) {
    if !echo.delay.is_zero() {
        tokio::time::sleep(echo.delay).await;
    }
    echo.processed.fetch_add(1, Ordering::Relaxed);

    if body.is_empty() {
        return (StatusCode::OK, Json(json!({})));
    }
    match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => (StatusCode::OK, Json(payload)),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_json", "message": e.to_string() })),
        ),
    }
}

async fn status(State(echo): State<Arc<Echo>>) -> Json<Value> {
    Json(json!({
        "worker": echo.name,
        "pid": std::process::id(),
        "uptime_ms": echo.started.elapsed().as_millis() as u64,
        "processed": echo.processed.load(Ordering::Relaxed),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    corral_log::init_for("corral-echo");
    let args = Args::parse();

    let echo = Arc::new(Echo {
        name: args.name.clone(),
        delay: Duration::from_millis(args.delay_ms),
        started: Instant::now(),
        processed: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/process", post(process))
        .route("/status", get(status))
        .with_state(echo);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Printed to stdout so the supervisor captures it.
    println!("{} listening on {}", args.name, addr);
    info!(worker = %args.name, addr = %addr, "Echo worker ready");

    axum::serve(listener, app).await.context("serving echo worker")?;
    Ok(())
}
