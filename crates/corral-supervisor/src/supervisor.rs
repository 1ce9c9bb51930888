// ABOUTME: ProcessSupervisor owns the worker table and drives worker lifecycles.
// ABOUTME: Start with readiness polling, SIGTERM-then-kill stop, and memory-only status.

use crate::error::SupervisorError;
use crate::health::{HealthChecker, ProbeOutcome};
use crate::process::{wait_for_exit, ExitInfo, ProcessControl, WorkerProcess};
use chrono::{DateTime, Utc};
use corral_core::{
    LineRing, LogBuffer, LogEntry, LogLevel, LogSink, SupervisorSettings, WorkerConfig,
    WorkerSnapshot, WorkerStatus, SUPERVISOR_SOURCE,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

/// How long to wait for reaping after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Returned by a successful `start_service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub name: String,
    pub pid: Option<u32>,
    /// Probes issued before the worker answered healthy
    pub attempts: u32,
}

/// Why a worker cannot take traffic right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    NotRegistered,
    NotRunning(WorkerStatus),
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered => f.write_str("not registered"),
            Self::NotRunning(status) => write!(f, "not running ({status})"),
        }
    }
}

struct WorkerRuntime {
    run_id: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    status: WorkerStatus,
    control: ProcessControl,
}

struct ExitRecord {
    status: WorkerStatus,
    exit_code: Option<i32>,
    exited_at: DateTime<Utc>,
}

struct WorkerSlot {
    config: WorkerConfig,
    runtime: Option<WorkerRuntime>,
    last_exit: Option<ExitRecord>,
    lines: LineRing,
}

impl WorkerSlot {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            runtime: None,
            last_exit: None,
            lines: LineRing::default(),
        }
    }

    fn status(&self) -> WorkerStatus {
        match (&self.runtime, &self.last_exit) {
            (Some(rt), _) => rt.status,
            (None, Some(exit)) => exit.status,
            (None, None) => WorkerStatus::Stopped,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let (pid, started_at, uptime_ms) = match &self.runtime {
            Some(rt) => (
                rt.pid,
                Some(rt.started_at),
                Some(rt.started.elapsed().as_millis() as u64),
            ),
            None => (None, None, None),
        };
        let (exit_code, exited_at) = match (&self.runtime, &self.last_exit) {
            (None, Some(exit)) => (exit.exit_code, Some(exit.exited_at)),
            _ => (None, None),
        };

        WorkerSnapshot {
            name: self.config.name.clone(),
            port: self.config.port,
            status: self.status(),
            pid,
            started_at,
            uptime_ms,
            exit_code,
            exited_at,
            recent_logs: self.lines.to_vec(),
        }
    }
}

#[derive(Default)]
struct Table {
    slots: HashMap<String, WorkerSlot>,
    order: Vec<String>,
}

struct Inner {
    settings: SupervisorSettings,
    table: Mutex<Table>,
    logs: LogBuffer,
    checker: HealthChecker,
    next_run: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Inner {
    // Never held across an await.
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, level: LogLevel, message: impl Into<String>) {
        self.logs.record(level, SUPERVISOR_SOURCE, message);
    }

    /// Exit observer callback. Ignores exits from runs that were replaced.
    fn on_exit(&self, name: &str, run_id: u64, exit: ExitInfo) {
        let (level, message) = {
            let mut table = self.table();
            let Some(slot) = table.slots.get_mut(name) else {
                return;
            };
            if slot.runtime.as_ref().map(|rt| rt.run_id) != Some(run_id) {
                return;
            }
            let Some(runtime) = slot.runtime.take() else {
                return;
            };

            let requested = runtime.status == WorkerStatus::Stopping;
            let status = if exit.success || requested {
                WorkerStatus::Stopped
            } else {
                WorkerStatus::Failed
            };
            let code = match exit.code {
                Some(code) => code.to_string(),
                None => "none (signal)".to_string(),
            };
            let (level, message) = if status == WorkerStatus::Failed {
                (LogLevel::Error, format!("{name} exited with code {code}"))
            } else {
                (LogLevel::Info, format!("{name} stopped (code {code})"))
            };

            slot.lines.push(message.clone());
            slot.last_exit = Some(ExitRecord {
                status,
                exit_code: exit.code,
                exited_at: Utc::now(),
            });
            (level, message)
        };

        self.record(level, message);
    }
}

impl LogSink for Inner {
    fn append_log(&self, worker: &str, level: LogLevel, line: &str) {
        if let Some(slot) = self.table().slots.get_mut(worker) {
            slot.lines.push(line);
        }
        self.logs.record(level, worker, line);
    }
}

/// Cheaply clonable handle to one supervisor instance.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Result<Self, SupervisorError> {
        let checker = HealthChecker::new()?;
        let logs = LogBuffer::new(settings.log_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                table: Mutex::new(Table::default()),
                logs,
                checker,
                next_run: AtomicU64::new(1),
                started_at: Utc::now(),
                started: Instant::now(),
            }),
        })
    }

    /// Create a supervisor and register every worker in order.
    pub fn with_workers<I>(
        settings: SupervisorSettings,
        workers: I,
    ) -> Result<Self, SupervisorError>
    where
        I: IntoIterator<Item = WorkerConfig>,
    {
        let supervisor = Self::new(settings)?;
        for worker in workers {
            supervisor.register(worker)?;
        }
        Ok(supervisor)
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.inner.logs
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Add a worker. Names and ports must be unique.
    pub fn register(&self, config: WorkerConfig) -> Result<(), SupervisorError> {
        config.validate()?;

        let mut table = self.inner.table();
        if table.slots.contains_key(&config.name) {
            return Err(corral_core::ConfigError::DuplicateWorker(config.name).into());
        }
        if let Some(existing) = table.slots.values().find(|s| s.config.port == config.port) {
            return Err(corral_core::ConfigError::DuplicatePort {
                port: config.port,
                first: existing.config.name.clone(),
                second: config.name,
            }
            .into());
        }

        tracing::debug!(worker = %config.name, port = config.port, "Registered worker");
        table.order.push(config.name.clone());
        table.slots.insert(config.name.clone(), WorkerSlot::new(config));
        Ok(())
    }

    /// Worker names in registration order.
    pub fn worker_names(&self) -> Vec<String> {
        self.inner.table().order.clone()
    }

    pub fn worker_config(&self, name: &str) -> Option<WorkerConfig> {
        self.inner
            .table()
            .slots
            .get(name)
            .map(|slot| slot.config.clone())
    }

    /// Config of a worker that is currently Running.
    pub fn running_config(&self, name: &str) -> Result<WorkerConfig, Unavailable> {
        let table = self.inner.table();
        let slot = table.slots.get(name).ok_or(Unavailable::NotRegistered)?;
        match slot.status() {
            WorkerStatus::Running => Ok(slot.config.clone()),
            status => Err(Unavailable::NotRunning(status)),
        }
    }

    /// Spawn a worker and wait until it answers its health check.
    pub async fn start_service(&self, name: &str) -> Result<StartReport, SupervisorError> {
        let pid = self.launch(name)?;
        let settings = &self.inner.settings;

        match self
            .wait_for_ready(
                name,
                settings.readiness_attempts,
                settings.readiness_interval(),
            )
            .await
        {
            Ok(attempts) => Ok(StartReport {
                name: name.to_string(),
                pid,
                attempts,
            }),
            Err(err @ SupervisorError::ReadinessTimeout { .. }) => {
                self.inner.record(LogLevel::Error, err.to_string());
                if settings.stop_unready {
                    self.stop_service(name).await?;
                }
                Err(err)
            }
            Err(err) => {
                self.inner.record(LogLevel::Error, err.to_string());
                Err(err)
            }
        }
    }

    /// Reserve the slot, spawn the child, and attach its exit observer
    /// in one critical section.
    fn launch(&self, name: &str) -> Result<Option<u32>, SupervisorError> {
        let sink: Arc<dyn LogSink> = self.inner.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let mut table = self.inner.table();
        let slot = table
            .slots
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
        if let Some(ref rt) = slot.runtime {
            return Err(SupervisorError::AlreadyActive {
                name: name.to_string(),
                status: rt.status,
            });
        }

        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        slot.lines.clear();

        let process = match WorkerProcess::spawn(&slot.config, sink) {
            Ok(process) => process,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    name: name.to_string(),
                    source,
                };
                slot.last_exit = Some(ExitRecord {
                    status: WorkerStatus::Failed,
                    exit_code: None,
                    exited_at: Utc::now(),
                });
                drop(table);
                self.inner.record(LogLevel::Error, err.to_string());
                return Err(err);
            }
        };

        let pid = process.pid();
        let worker = name.to_string();
        let control = process.observe(move |exit| {
            if let Some(inner) = weak.upgrade() {
                inner.on_exit(&worker, run_id, exit);
            }
        });

        slot.runtime = Some(WorkerRuntime {
            run_id,
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            status: WorkerStatus::Starting,
            control,
        });
        drop(table);

        self.inner.record(
            LogLevel::Info,
            format!("started {name} (pid {})", pid_label(pid)),
        );
        Ok(pid)
    }

    /// Probe until healthy, at most `max_attempts` times, sleeping `interval`
    /// between failures. Returns the number of probes issued.
    pub async fn wait_for_ready(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<u32, SupervisorError> {
        let (run_id, config) = {
            let table = self.inner.table();
            let slot = table
                .slots
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
            match slot.runtime {
                Some(ref rt) => (rt.run_id, slot.config.clone()),
                None => {
                    return Err(SupervisorError::ExitedBeforeReady {
                        name: name.to_string(),
                        attempts: 0,
                    })
                }
            }
        };

        let timeout = self.inner.settings.probe_timeout();
        let mut last_reason = String::from("no probe attempted");

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(interval).await;
            }

            match self.run_status(name, run_id) {
                Some(WorkerStatus::Starting) => {}
                Some(WorkerStatus::Running) => return Ok(attempt - 1),
                _ => {
                    return Err(SupervisorError::ExitedBeforeReady {
                        name: name.to_string(),
                        attempts: attempt - 1,
                    })
                }
            }

            match self.inner.checker.probe(&config, timeout).await {
                ProbeOutcome::Healthy { .. } => {
                    if !self.mark_running(name, run_id) {
                        return Err(SupervisorError::ExitedBeforeReady {
                            name: name.to_string(),
                            attempts: attempt,
                        });
                    }
                    self.inner.record(
                        LogLevel::Info,
                        format!("{name} is ready after {attempt} attempt(s)"),
                    );
                    return Ok(attempt);
                }
                ProbeOutcome::Unhealthy { reason } => {
                    tracing::debug!(worker = %name, attempt, reason = %reason, "Not ready yet");
                    last_reason = reason;
                }
            }
        }

        Err(SupervisorError::ReadinessTimeout {
            name: name.to_string(),
            attempts: max_attempts,
            last_reason,
        })
    }

    fn run_status(&self, name: &str, run_id: u64) -> Option<WorkerStatus> {
        let table = self.inner.table();
        let rt = table.slots.get(name)?.runtime.as_ref()?;
        (rt.run_id == run_id).then_some(rt.status)
    }

    fn mark_running(&self, name: &str, run_id: u64) -> bool {
        let mut table = self.inner.table();
        let Some(rt) = table
            .slots
            .get_mut(name)
            .and_then(|slot| slot.runtime.as_mut())
        else {
            return false;
        };
        if rt.run_id != run_id {
            return false;
        }
        match rt.status {
            WorkerStatus::Starting => {
                rt.status = WorkerStatus::Running;
                true
            }
            WorkerStatus::Running => true,
            _ => false,
        }
    }

    /// Stop a worker: SIGTERM, grace window, then forced kill.
    ///
    /// Returns `Ok(false)` when there was nothing to stop or a stop is
    /// already in flight.
    pub async fn stop_service(&self, name: &str) -> Result<bool, SupervisorError> {
        let (run_id, pid, mut exited, signalled) = {
            let mut table = self.inner.table();
            let slot = table
                .slots
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
            let Some(rt) = slot.runtime.as_mut() else {
                return Ok(false);
            };
            if rt.status == WorkerStatus::Stopping {
                return Ok(false);
            }
            rt.status = WorkerStatus::Stopping;
            let signalled = rt.control.terminate();
            if signalled.is_err() {
                rt.control.force_kill();
            }
            (rt.run_id, rt.pid, rt.control.exit_watch(), signalled)
        };

        match signalled {
            Ok(()) => self.inner.record(
                LogLevel::Info,
                format!("sent graceful stop signal to {name} (pid {})", pid_label(pid)),
            ),
            Err(e) => self.inner.record(
                LogLevel::Warn,
                format!("failed to signal {name}: {e}, killing"),
            ),
        }

        let grace = self.inner.settings.grace_period();
        if wait_for_exit(&mut exited, grace).await {
            return Ok(true);
        }

        self.inner.record(
            LogLevel::Warn,
            format!(
                "{name} did not exit within {}ms, killing",
                grace.as_millis()
            ),
        );
        {
            let mut table = self.inner.table();
            if let Some(rt) = table
                .slots
                .get_mut(name)
                .and_then(|slot| slot.runtime.as_mut())
                .filter(|rt| rt.run_id == run_id)
            {
                rt.control.force_kill();
            }
        }

        if !wait_for_exit(&mut exited, KILL_WAIT).await {
            self.inner.record(
                LogLevel::Error,
                format!("{name} still running after kill"),
            );
        }
        Ok(true)
    }

    /// Stop every worker concurrently. Returns the names that were stopped
    /// by this call.
    pub async fn shutdown_all(&self) -> Vec<String> {
        let names = self.worker_names();
        let results = join_all(names.iter().map(|name| self.stop_service(name))).await;

        let stopped: Vec<String> = names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| match result {
                Ok(true) => Some(name),
                Ok(false) => None,
                Err(e) => {
                    tracing::warn!(worker = %name, error = %e, "Stop failed during shutdown");
                    None
                }
            })
            .collect();

        if !stopped.is_empty() {
            self.inner.record(
                LogLevel::Info,
                format!("shutdown complete, stopped {} worker(s)", stopped.len()),
            );
        }
        stopped
    }

    /// Memory-only snapshot of every worker in registration order.
    pub fn get_status(&self) -> Vec<WorkerSnapshot> {
        let table = self.inner.table();
        table
            .order
            .iter()
            .filter_map(|name| table.slots.get(name))
            .map(WorkerSlot::snapshot)
            .collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<WorkerSnapshot> {
        self.inner.table().slots.get(name).map(WorkerSlot::snapshot)
    }

    /// One live health probe against a registered worker.
    pub async fn probe(&self, name: &str) -> Result<ProbeOutcome, SupervisorError> {
        let config = self
            .worker_config(name)
            .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))?;
        Ok(self
            .inner
            .checker
            .probe(&config, self.inner.settings.probe_timeout())
            .await)
    }

    /// Probe every registered worker concurrently.
    pub async fn probe_all(&self) -> Vec<(String, ProbeOutcome)> {
        let configs: Vec<WorkerConfig> = {
            let table = self.inner.table();
            table
                .order
                .iter()
                .filter_map(|name| table.slots.get(name))
                .map(|slot| slot.config.clone())
                .collect()
        };
        let timeout = self.inner.settings.probe_timeout();
        let checker = &self.inner.checker;

        join_all(configs.into_iter().map(|config| async move {
            let outcome = checker.probe(&config, timeout).await;
            (config.name, outcome)
        }))
        .await
    }

    /// Last `n` entries of the supervisor log ring, oldest first.
    pub fn recent_logs(&self, n: usize) -> Vec<LogEntry> {
        self.inner.logs.recent(n)
    }

    /// Start every registered worker one at a time, pausing `delay` between
    /// launches. Failures are logged and do not stop the sequence.
    pub async fn start_all(
        &self,
        delay: Duration,
    ) -> Vec<(String, Result<StartReport, SupervisorError>)> {
        let names = self.worker_names();
        let mut results = Vec::with_capacity(names.len());

        for (i, name) in names.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = self.start_service(&name).await;
            if let Err(ref e) = result {
                tracing::warn!(worker = %name, error = %e, "Worker failed to start");
            }
            results.push((name, result));
        }
        results
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("workers", &self.worker_names())
            .finish()
    }
}

fn pid_label(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
}
