// ABOUTME: StatusReporter aggregates supervisor and worker state into one report
// ABOUTME: Reads memory only; never probes workers

use chrono::{DateTime, Utc};
use corral_core::{LogEntry, WorkerSnapshot};
use corral_supervisor::ProcessSupervisor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub orchestrator: &'static str,
    pub supervisor_started_at: DateTime<Utc>,
    pub supervisor_uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_memory_bytes: Option<u64>,
    pub total_workers: usize,
    pub running_workers: usize,
    pub workers: Vec<WorkerSnapshot>,
    pub recent_logs: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    supervisor: ProcessSupervisor,
    log_tail: usize,
    /// Last sampled resident memory; 0 until a sample lands.
    memory_bytes: Arc<AtomicU64>,
}

impl StatusReporter {
    pub fn new(supervisor: ProcessSupervisor, log_tail: usize) -> Self {
        Self {
            supervisor,
            log_tail,
            memory_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sample this process's memory every `every` on the blocking pool.
    ///
    /// Reports omit `supervisor_memory_bytes` until the first sample.
    pub fn spawn_memory_sampler(&self, every: Duration) -> JoinHandle<()> {
        let memory_bytes = self.memory_bytes.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match tokio::task::spawn_blocking(current_memory_bytes).await {
                    Ok(bytes) => memory_bytes.store(bytes.unwrap_or(0), Ordering::Relaxed),
                    Err(e) => {
                        tracing::warn!(error = %e, "Memory sampling task failed");
                    }
                }
            }
        })
    }

    pub fn report(&self) -> StatusReport {
        let workers = self.supervisor.get_status();
        let running_workers = workers.iter().filter(|w| w.is_running()).count();
        let memory = self.memory_bytes.load(Ordering::Relaxed);

        StatusReport {
            timestamp: Utc::now(),
            orchestrator: "corral",
            supervisor_started_at: self.supervisor.started_at(),
            supervisor_uptime_ms: self.supervisor.uptime().as_millis() as u64,
            supervisor_memory_bytes: (memory > 0).then_some(memory),
            total_workers: workers.len(),
            running_workers,
            workers,
            recent_logs: self.supervisor.recent_logs(self.log_tail),
        }
    }
}

/// Resident memory of this process, if the platform exposes it.
fn current_memory_bytes() -> Option<u64> {
    use sysinfo::System;

    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid).map(|process| process.memory())
}
