// ABOUTME: Dispatch errors and their mapping onto HTTP error responses
// ABOUTME: Every error body carries a stable snake_case code and a message

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use corral_supervisor::{SupervisorError, Unavailable};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Worker '{worker}' is {reason}")]
    WorkerUnavailable { worker: String, reason: Unavailable },

    #[error("Worker '{worker}' did not answer within {timeout_ms}ms")]
    UpstreamTimeout { worker: String, timeout_ms: u64 },

    #[error("Request to worker '{worker}' failed: {source}")]
    UpstreamTransport {
        worker: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Worker '{worker}' answered HTTP {status}")]
    UpstreamStatus {
        worker: String,
        status: u16,
        body: String,
    },
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkerUnavailable {
                reason: Unavailable::NotRegistered,
                ..
            } => "worker_not_found",
            Self::WorkerUnavailable { .. } => "worker_not_running",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamTransport { .. } => "upstream_error",
            Self::UpstreamStatus { .. } => "upstream_status",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::WorkerUnavailable {
                reason: Unavailable::NotRegistered,
                ..
            } => StatusCode::NOT_FOUND,
            Self::WorkerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamTransport { .. } | Self::UpstreamStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn worker(&self) -> &str {
        match self {
            Self::WorkerUnavailable { worker, .. }
            | Self::UpstreamTimeout { worker, .. }
            | Self::UpstreamTransport { worker, .. }
            | Self::UpstreamStatus { worker, .. } => worker,
        }
    }
}

/// JSON error response: `{"error": code, "message": ..., ...details}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let api = Self::new(err.status_code(), err.code(), err.to_string())
            .with_detail("worker", err.worker());
        match err {
            DispatchError::WorkerUnavailable {
                reason: Unavailable::NotRunning(status),
                ..
            } => api.with_detail("status", status.as_str()),
            DispatchError::UpstreamStatus { status, body, .. } => api
                .with_detail("upstream_status", status)
                .with_detail("upstream_body", body),
            _ => api,
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            SupervisorError::Config(_) => StatusCode::BAD_REQUEST,
            SupervisorError::AlreadyActive { .. } => StatusCode::CONFLICT,
            SupervisorError::Spawn { .. } | SupervisorError::ExitedBeforeReady { .. } => {
                StatusCode::BAD_GATEWAY
            }
            SupervisorError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SupervisorError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, message = %self.message, "Request failed");
        } else {
            tracing::debug!(code = self.code, message = %self.message, "Request rejected");
        }

        let mut body = Map::new();
        body.insert("error".to_string(), json!(self.code));
        body.insert("message".to_string(), json!(self.message));
        body.extend(self.details);
        (self.status, Json(Value::Object(body))).into_response()
    }
}
