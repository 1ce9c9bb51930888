// ABOUTME: axum router for the corral gateway wire API
// ABOUTME: Health, status, dispatch, fan-out, and worker start/stop endpoints

use crate::dispatch::RequestGateway;
use crate::error::ApiError;
use crate::status::StatusReporter;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use corral_core::{GatewaySettings, WorkerStatus};
use corral_supervisor::ProcessSupervisor;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Path every worker serves its processing endpoint on.
pub const WORKER_PROCESS_PATH: &str = "/process";

#[derive(Debug, Clone)]
pub struct AppState {
    pub gateway: RequestGateway,
    pub reporter: StatusReporter,
}

impl AppState {
    pub fn new(
        supervisor: ProcessSupervisor,
        settings: &GatewaySettings,
    ) -> Result<Self, reqwest::Error> {
        let gateway = RequestGateway::new(supervisor.clone(), settings.request_timeout())?;
        let reporter = StatusReporter::new(supervisor, settings.status_log_tail);
        Ok(Self { gateway, reporter })
    }

    fn supervisor(&self) -> &ProcessSupervisor {
        self.gateway.supervisor()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/health/probe", get(health_probe))
        .route("/status", get(status))
        .route("/process/multi", post(process_multi))
        .route("/process/{worker}", post(process_one))
        .route("/workers/{worker}/start", post(start_worker))
        .route("/workers/{worker}/stop", post(stop_worker))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(answer_preflight))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// OPTIONS on any path gets an empty 200.
async fn answer_preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

/// Aggregate readiness: healthy only when every registered worker is Running.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let workers = state.supervisor().get_status();
    let healthy = workers.iter().all(|w| w.status == WorkerStatus::Running);

    let statuses: Map<String, Value> = workers
        .iter()
        .map(|w| (w.name.clone(), json!(w.status)))
        .collect();

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "workers": statuses,
            "timestamp": Utc::now(),
        })),
    )
}

/// Live probe of every worker.
async fn health_probe(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let outcomes = state.supervisor().probe_all().await;
    let healthy = outcomes.iter().all(|(_, outcome)| outcome.is_healthy());

    let checks: Map<String, Value> = outcomes
        .into_iter()
        .map(|(name, outcome)| (name, json!(outcome)))
        .collect();

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "health_checks": checks,
            "timestamp": Utc::now(),
        })),
    )
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.reporter.report())
}

async fn process_one(
    State(state): State<AppState>,
    Path(worker): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload = parse_body(&body)?;
    let data = state
        .gateway
        .dispatch(&worker, WORKER_PROCESS_PATH, Method::POST, payload.as_ref())
        .await?;
    Ok(Json(data))
}

async fn process_multi(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let payload = parse_body(&body)?;
    let targets = state.supervisor().worker_names();
    let report = state
        .gateway
        .dispatch_fan_out(&targets, WORKER_PROCESS_PATH, Method::POST, payload.as_ref())
        .await;
    Ok(Json(report))
}

async fn start_worker(
    State(state): State<AppState>,
    Path(worker): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.supervisor().start_service(&worker).await?;
    Ok(Json(report))
}

async fn stop_worker(
    State(state): State<AppState>,
    Path(worker): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stopped = state.supervisor().stop_service(&worker).await?;
    let status = state
        .supervisor()
        .snapshot(&worker)
        .map(|snapshot| snapshot.status);
    Ok(Json(json!({
        "worker": worker,
        "stopped": stopped,
        "status": status,
    })))
}

/// Unknown paths and known paths with the wrong method both land here.
async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("No route for {} {}", method, uri.path()),
    )
    .with_detail("path", uri.path())
    .with_detail("method", method.as_str())
}

/// Empty bodies mean "no payload"; anything else must be JSON.
fn parse_body(body: &[u8]) -> Result<Option<Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body).map(Some).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("Request body is not valid JSON: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_empty_is_none() {
        assert_eq!(parse_body(b"").unwrap(), None);
        assert_eq!(parse_body(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_parse_body_json() {
        assert_eq!(parse_body(br#"{"x":1}"#).unwrap(), Some(json!({"x": 1})));
    }

    #[test]
    fn test_parse_body_invalid_is_400() {
        let err = parse_body(b"{not json").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_json");
    }
}
