// ABOUTME: Integration tests for ProcessSupervisor with real child processes.
// ABOUTME: Health endpoints are in-process axum servers; workers are sh/sleep children.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use corral_core::{LogLevel, SupervisorSettings, WorkerConfig, WorkerStatus};
use corral_supervisor::{ProcessSupervisor, SupervisorError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct FakeHealth {
    hits: AtomicU32,
    fail_first: u32,
}

async fn health(State(state): State<Arc<FakeHealth>>) -> (StatusCode, Json<Value>) {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if hit > state.fail_first {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "warming"})),
        )
    }
}

/// Serve a health endpoint that fails the first `fail_first` probes.
async fn fake_health(fail_first: u32) -> (u16, Arc<FakeHealth>) {
    let state = Arc::new(FakeHealth {
        hits: AtomicU32::new(0),
        fail_first,
    });
    let app = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, state)
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        readiness_attempts: 5,
        readiness_interval_ms: 20,
        probe_timeout_ms: 500,
        grace_period_ms: 2000,
        ..SupervisorSettings::default()
    }
}

fn shell_worker(name: &str, port: u16, script: &str) -> WorkerConfig {
    WorkerConfig::new(name, ["sh", "-c", script], port).with_host("127.0.0.1")
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    false
}

fn count_logs(sup: &ProcessSupervisor, needle: &str) -> usize {
    sup.recent_logs(500)
        .iter()
        .filter(|e| e.message.contains(needle))
        .count()
}

#[tokio::test]
async fn test_start_marks_running_with_pid() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();

    let report = sup.start_service("w").await.unwrap();
    assert_eq!(report.attempts, 1);
    assert!(report.pid.is_some());

    let snap = sup.snapshot("w").unwrap();
    assert_eq!(snap.status, WorkerStatus::Running);
    assert_eq!(snap.pid, report.pid);
    assert!(snap.started_at.is_some());
    assert!(sup.running_config("w").is_ok());

    assert_eq!(sup.shutdown_all().await, vec!["w".to_string()]);
    let snap = sup.snapshot("w").unwrap();
    assert_eq!(snap.status, WorkerStatus::Stopped);
    assert!(snap.pid.is_none());
}

#[tokio::test]
async fn test_readiness_timeout_issues_exactly_max_attempts() {
    let (port, health) = fake_health(u32::MAX).await;
    let sup = ProcessSupervisor::new(SupervisorSettings {
        readiness_attempts: 4,
        ..fast_settings()
    })
    .unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();

    let err = sup.start_service("w").await.unwrap_err();
    match err {
        SupervisorError::ReadinessTimeout {
            attempts,
            ref last_reason,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(last_reason, "HTTP 503");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(health.hits.load(Ordering::SeqCst), 4);

    // Left registered and alive but never Running.
    let snap = sup.snapshot("w").unwrap();
    assert_eq!(snap.status, WorkerStatus::Starting);
    assert!(snap.pid.is_some());

    sup.shutdown_all().await;
}

#[tokio::test]
async fn test_stop_unready_stops_worker_after_timeout() {
    let (port, _) = fake_health(u32::MAX).await;
    let sup = ProcessSupervisor::new(SupervisorSettings {
        readiness_attempts: 2,
        stop_unready: true,
        ..fast_settings()
    })
    .unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();

    let err = sup.start_service("w").await.unwrap_err();
    assert_eq!(err.code(), "readiness_timeout");

    let snap = sup.snapshot("w").unwrap();
    assert_eq!(snap.status, WorkerStatus::Stopped);
    assert!(snap.pid.is_none());
}

#[tokio::test]
async fn test_ready_after_some_failures() {
    let (port, health) = fake_health(2).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();

    let report = sup.start_service("w").await.unwrap();
    assert_eq!(report.attempts, 3);
    assert_eq!(health.hits.load(Ordering::SeqCst), 3);

    sup.shutdown_all().await;
}

#[tokio::test]
async fn test_exit_before_ready_is_reported_failed() {
    let sup = ProcessSupervisor::new(SupervisorSettings {
        readiness_attempts: 50,
        readiness_interval_ms: 50,
        ..fast_settings()
    })
    .unwrap();
    sup.register(shell_worker("quitter", closed_port(), "exit 3"))
        .unwrap();

    let err = sup.start_service("quitter").await.unwrap_err();
    assert!(
        matches!(err, SupervisorError::ExitedBeforeReady { .. }),
        "unexpected error: {err}"
    );

    let snap = sup.snapshot("quitter").unwrap();
    assert_eq!(snap.status, WorkerStatus::Failed);
    assert_eq!(snap.exit_code, Some(3));
    assert!(snap.pid.is_none());
    assert!(snap.exited_at.is_some());
}

#[tokio::test]
async fn test_crash_after_ready_is_failed_without_restart() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("w", port, "sleep 0.3; exit 5"))
        .unwrap();

    sup.start_service("w").await.unwrap();
    assert!(eventually(|| sup.snapshot("w").unwrap().status == WorkerStatus::Failed).await);

    let snap = sup.snapshot("w").unwrap();
    assert_eq!(snap.exit_code, Some(5));
    assert!(snap.pid.is_none());
    assert!(sup
        .recent_logs(50)
        .iter()
        .any(|e| e.level == LogLevel::Error && e.message == "w exited with code 5"));

    // No automatic restart.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sup.snapshot("w").unwrap().status, WorkerStatus::Failed);
}

#[tokio::test]
async fn test_output_is_captured_by_stream() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker(
        "talker",
        port,
        "echo hello; echo oops >&2; exec sleep 30",
    ))
    .unwrap();

    sup.start_service("talker").await.unwrap();
    assert!(eventually(|| count_logs(&sup, "hello") == 1 && count_logs(&sup, "oops") == 1).await);

    let logs = sup.recent_logs(50);
    let hello = logs.iter().find(|e| e.message == "hello").unwrap();
    assert_eq!(hello.level, LogLevel::Info);
    assert_eq!(hello.source, "talker");
    let oops = logs.iter().find(|e| e.message == "oops").unwrap();
    assert_eq!(oops.level, LogLevel::Warn);

    let snap = sup.snapshot("talker").unwrap();
    assert!(snap.recent_logs.contains(&"hello".to_string()));

    sup.shutdown_all().await;
}

#[tokio::test]
async fn test_port_and_environment_are_passed() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(
        shell_worker(
            "envy",
            port,
            "echo \"port=$APP_PORT mode=$MODE\"; exec sleep 30",
        )
        .with_port_env("APP_PORT")
        .with_env("MODE", "test"),
    )
    .unwrap();

    sup.start_service("envy").await.unwrap();
    let expected = format!("port={port} mode=test");
    assert!(eventually(|| count_logs(&sup, &expected) == 1).await);

    sup.shutdown_all().await;
}

#[tokio::test]
async fn test_start_twice_is_already_active() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();

    sup.start_service("w").await.unwrap();
    let err = sup.start_service("w").await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::AlreadyActive {
            status: WorkerStatus::Running,
            ..
        }
    ));

    sup.shutdown_all().await;
}

#[tokio::test]
async fn test_restart_after_stop_gets_new_run() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();

    let first = sup.start_service("w").await.unwrap();
    assert!(sup.stop_service("w").await.unwrap());
    assert_eq!(sup.snapshot("w").unwrap().status, WorkerStatus::Stopped);

    let second = sup.start_service("w").await.unwrap();
    assert_ne!(first.pid, second.pid);
    assert_eq!(sup.snapshot("w").unwrap().status, WorkerStatus::Running);

    sup.shutdown_all().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_under_concurrency() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("w", port, "exec sleep 30")).unwrap();
    sup.start_service("w").await.unwrap();

    let (a, b) = tokio::join!(sup.shutdown_all(), sup.shutdown_all());
    assert_eq!(a.len() + b.len(), 1);
    assert!(sup.shutdown_all().await.is_empty());

    assert_eq!(count_logs(&sup, "sent graceful stop signal to w"), 1);
    assert_eq!(sup.snapshot("w").unwrap().status, WorkerStatus::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_stubborn_worker_is_force_killed() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(SupervisorSettings {
        grace_period_ms: 300,
        ..fast_settings()
    })
    .unwrap();
    sup.register(shell_worker(
        "stubborn",
        port,
        "trap '' TERM; while true; do sleep 0.1; done",
    ))
    .unwrap();

    sup.start_service("stubborn").await.unwrap();
    // Let the shell install its trap before signalling.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(sup.stop_service("stubborn").await.unwrap());
    assert_eq!(count_logs(&sup, "did not exit within 300ms, killing"), 1);

    let snap = sup.snapshot("stubborn").unwrap();
    assert_eq!(snap.status, WorkerStatus::Stopped);
    assert!(snap.pid.is_none());
}

#[tokio::test]
async fn test_probe_all_reports_each_worker() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::new(fast_settings()).unwrap();
    sup.register(shell_worker("up", port, "exec sleep 30")).unwrap();
    sup.register(shell_worker("down", closed_port(), "exec sleep 30"))
        .unwrap();

    let outcomes = sup.probe_all().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].0, "up");
    assert!(outcomes[0].1.is_healthy());
    assert_eq!(outcomes[1].0, "down");
    assert!(!outcomes[1].1.is_healthy());
}

#[tokio::test]
async fn test_start_all_continues_past_failures() {
    let (port, _) = fake_health(0).await;
    let sup = ProcessSupervisor::with_workers(
        fast_settings(),
        vec![
            WorkerConfig::new("ghost", ["/no/such/binary"], closed_port()),
            shell_worker("real", port, "exec sleep 30"),
        ],
    )
    .unwrap();

    let results = sup.start_all(Duration::from_millis(10)).await;
    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_err());
    assert!(results[1].1.is_ok());

    let status = sup.get_status();
    assert_eq!(status[0].status, WorkerStatus::Failed);
    assert_eq!(status[1].status, WorkerStatus::Running);

    sup.shutdown_all().await;
}
