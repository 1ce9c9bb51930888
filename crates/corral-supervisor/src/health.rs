// ABOUTME: Single bounded-timeout readiness probe against a worker's health path.
// ABOUTME: No retries here; retry policy belongs to wait_for_ready.

use corral_core::WorkerConfig;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Result of one health probe. `reason` is for diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy {
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Unhealthy {
        reason: String,
    },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy { .. } => None,
            Self::Unhealthy { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Workers live on loopback; system proxies must not intercept probes.
        let client = Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }

    /// GET `http://{host}:{port}{health_path}`; healthy only on HTTP 200.
    pub async fn probe(&self, config: &WorkerConfig, timeout: Duration) -> ProbeOutcome {
        let url = config.health_url();
        let exchange = async {
            let response = self.client.get(&url).timeout(timeout).send().await?;
            let status = response.status();
            let body = if status == StatusCode::OK {
                response.json::<Value>().await.ok()
            } else {
                None
            };
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => ProbeOutcome::Unhealthy {
                reason: timed_out(timeout),
            },
            Ok(Err(e)) => ProbeOutcome::Unhealthy {
                reason: describe_error(&e, timeout),
            },
            Ok(Ok((status, body))) if status == StatusCode::OK => ProbeOutcome::Healthy { body },
            Ok(Ok((status, _))) => ProbeOutcome::Unhealthy {
                reason: format!("HTTP {}", status.as_u16()),
            },
        }
    }
}

fn timed_out(timeout: Duration) -> String {
    format!("timed out after {}ms", timeout.as_millis())
}

fn describe_error(error: &reqwest::Error, timeout: Duration) -> String {
    if error.is_timeout() {
        return timed_out(timeout);
    }
    if error.is_connect() {
        if is_connection_refused(error) {
            return format!("connection refused: {}", error);
        }
        return format!("connection failed: {}", error);
    }
    format!("request failed: {}", error)
}

fn is_connection_refused(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = err.source();
    }
    false
}
