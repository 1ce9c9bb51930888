// ABOUTME: RequestGateway forwards client payloads to running workers.
// ABOUTME: Single-target dispatch and concurrent fan-out with per-call timeouts.

use crate::error::DispatchError;
use corral_supervisor::ProcessSupervisor;
use futures::future::join_all;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Per-target result of a fan-out call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetOutcome {
    Success {
        data: Value,
        latency_ms: u64,
    },
    Failure {
        error: String,
        message: String,
        latency_ms: u64,
    },
}

impl TargetOutcome {
    fn from_result(result: Result<Value, DispatchError>, latency: Duration) -> Self {
        let latency_ms = latency.as_millis() as u64;
        match result {
            Ok(data) => Self::Success { data, latency_ms },
            Err(e) => Self::Failure {
                error: e.code().to_string(),
                message: e.to_string(),
                latency_ms,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FanOutReport {
    pub results: BTreeMap<String, TargetOutcome>,
    pub duration_ms: u64,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct RequestGateway {
    supervisor: ProcessSupervisor,
    client: Client,
    timeout: Duration,
}

impl RequestGateway {
    pub fn new(supervisor: ProcessSupervisor, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().no_proxy().build()?;
        Ok(Self {
            supervisor,
            client,
            timeout,
        })
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Forward one request to a Running worker.
    ///
    /// Non-JSON bodies come back as `{"response": <text>, "raw": true}`.
    pub async fn dispatch(
        &self,
        target: &str,
        path: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<Value, DispatchError> {
        let config = self.supervisor.running_config(target).map_err(|reason| {
            DispatchError::WorkerUnavailable {
                worker: target.to_string(),
                reason,
            }
        })?;

        let url = config.url(path);
        tracing::debug!(worker = %target, %method, url = %url, "Dispatching request");

        let mut request = self.client.request(method, &url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let timed_out = || DispatchError::UpstreamTimeout {
            worker: target.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => Err(timed_out()),
            Ok(Err(e)) if e.is_timeout() => Err(timed_out()),
            Ok(Err(source)) => Err(DispatchError::UpstreamTransport {
                worker: target.to_string(),
                source,
            }),
            Ok(Ok((status, body))) if !status.is_success() => Err(DispatchError::UpstreamStatus {
                worker: target.to_string(),
                status: status.as_u16(),
                body,
            }),
            Ok(Ok((_, body))) => Ok(parse_payload(body)),
        }
    }

    /// Send the same request to every target at once and wait for all of
    /// them. Duplicate targets are called once.
    pub async fn dispatch_fan_out(
        &self,
        targets: &[String],
        path: &str,
        method: Method,
        body: Option<&Value>,
    ) -> FanOutReport {
        let started = Instant::now();

        let mut unique: Vec<&str> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(&target.as_str()) {
                unique.push(target);
            }
        }

        let calls = unique.into_iter().map(|target| {
            let method = method.clone();
            async move {
                let call_started = Instant::now();
                let result = self.dispatch(target, path, method, body).await;
                (
                    target.to_string(),
                    TargetOutcome::from_result(result, call_started.elapsed()),
                )
            }
        });
        let results: BTreeMap<String, TargetOutcome> = join_all(calls).await.into_iter().collect();

        let succeeded = results.values().filter(|o| o.is_success()).count();
        let failed = results.len() - succeeded;
        let duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            targets = results.len(),
            succeeded,
            failed,
            duration_ms,
            "Fan-out complete"
        );

        FanOutReport {
            results,
            duration_ms,
            succeeded,
            failed,
        }
    }
}

fn parse_payload(text: String) -> Value {
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => json!({ "response": text, "raw": true }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{SupervisorSettings, WorkerConfig};

    #[test]
    fn test_parse_payload_json_and_raw() {
        assert_eq!(parse_payload(r#"{"a":1}"#.to_string()), json!({"a": 1}));
        assert_eq!(
            parse_payload("plain text".to_string()),
            json!({"response": "plain text", "raw": true})
        );
        assert_eq!(
            parse_payload(String::new()),
            json!({"response": "", "raw": true})
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let ok = TargetOutcome::Success {
            data: json!({"x": 1}),
            latency_ms: 12,
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["data"]["x"], 1);

        let failed = TargetOutcome::Failure {
            error: "upstream_timeout".to_string(),
            message: "slow".to_string(),
            latency_ms: 5000,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["error"], "upstream_timeout");
    }

    #[tokio::test]
    async fn test_dispatch_to_stopped_worker_is_unavailable() {
        let supervisor = ProcessSupervisor::new(SupervisorSettings::default()).unwrap();
        supervisor
            .register(WorkerConfig::new("idle", ["true"], 9601))
            .unwrap();
        let gateway = RequestGateway::new(supervisor.clone(), Duration::from_secs(1)).unwrap();

        let err = gateway
            .dispatch("idle", "/process", Method::POST, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "worker_not_running");

        let err = gateway
            .dispatch("ghost", "/process", Method::POST, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "worker_not_found");
        assert_eq!(supervisor.worker_names(), vec!["idle"]);
    }

    #[tokio::test]
    async fn test_fan_out_collapses_duplicates() {
        let supervisor = ProcessSupervisor::new(SupervisorSettings::default()).unwrap();
        let gateway = RequestGateway::new(supervisor, Duration::from_secs(1)).unwrap();

        let targets = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let report = gateway
            .dispatch_fan_out(&targets, "/process", Method::POST, None)
            .await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 2);
    }
}
