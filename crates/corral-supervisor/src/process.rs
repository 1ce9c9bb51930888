// ABOUTME: Spawns worker child processes and forwards their output to a LogSink.
// ABOUTME: An exit observer task owns the child; ProcessControl signals it.

use corral_core::{LogLevel, LogSink, WorkerConfig};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when terminated by a signal or when the wait failed
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    fn from_wait(result: io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait on worker process");
                Self {
                    code: None,
                    success: false,
                }
            }
        }
    }
}

/// A freshly spawned worker whose output is already being captured.
pub struct WorkerProcess {
    worker: String,
    pid: Option<u32>,
    child: Child,
}

impl WorkerProcess {
    /// Spawn the worker's command with its extra environment.
    ///
    /// stdout lines go to the sink as INFO, stderr lines as WARN.
    pub fn spawn(config: &WorkerConfig, sink: Arc<dyn LogSink>) -> io::Result<Self> {
        let program = config
            .program()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(config.args())
            .envs(config.spawn_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        tracing::info!(worker = %config.name, pid = ?pid, "Spawned worker");

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, config.name.clone(), LogLevel::Info, Arc::clone(&sink));
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, config.name.clone(), LogLevel::Warn, sink);
        }

        Ok(Self {
            worker: config.name.clone(),
            pid,
            child,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand the child to an exit observer task. `on_exit` runs once the
    /// process has been reaped, before waiters on the control are released.
    pub fn observe<F>(self, on_exit: F) -> ProcessControl
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let Self {
            worker,
            pid,
            mut child,
        } = self;

        tokio::spawn(async move {
            let result = tokio::select! {
                result = child.wait() => result,
                Ok(()) = kill_rx => {
                    tracing::warn!(worker = %worker, pid = ?pid, "Force killing worker");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(worker = %worker, error = %e, "Kill failed");
                    }
                    child.wait().await
                }
            };

            let exit = ExitInfo::from_wait(result);
            on_exit(exit);
            let _ = exit_tx.send(Some(exit));
        });

        ProcessControl {
            pid,
            kill_tx: Some(kill_tx),
            exited: exit_rx,
        }
    }
}

fn forward_lines<R>(reader: R, worker: String, level: LogLevel, sink: Arc<dyn LogSink>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.append_log(&worker, level, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(worker = %worker, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    });
}

/// Handle used by the supervisor to signal a running worker.
#[derive(Debug)]
pub struct ProcessControl {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessControl {
    /// Send SIGTERM. Platforms without signals return `Unsupported`; callers
    /// fall back to `force_kill`.
    pub fn terminate(&self) -> io::Result<()> {
        match self.pid {
            Some(pid) => send_sigterm(pid),
            None => Ok(()),
        }
    }

    /// Request a forced kill. Returns false if one was already requested.
    pub fn force_kill(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Receiver that flips to `Some` once the process has been reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exited.clone()
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful stop is not supported on this platform",
    ))
}

/// Wait until the watched process is reaped or `timeout` elapses.
/// Returns true if the process is gone.
pub async fn wait_for_exit(
    exited: &mut watch::Receiver<Option<ExitInfo>>,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, exited.wait_for(Option::is_some)).await {
        Ok(Ok(_)) => true,
        // Observer task dropped without reporting: nothing left to wait on.
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::LogBuffer;

    fn shell(name: &str, script: &str) -> WorkerConfig {
        WorkerConfig::new(name, ["sh", "-c", script], 1)
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let sink: Arc<dyn LogSink> = Arc::new(LogBuffer::new(10));
        let config = WorkerConfig::new("ghost", ["/definitely/not/a/binary"], 1);
        let err = WorkerProcess::spawn(&config, sink).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_observer_reports_exit_code_and_output() {
        let buffer = Arc::new(LogBuffer::new(10));
        let sink: Arc<dyn LogSink> = buffer.clone();
        let process =
            WorkerProcess::spawn(&shell("w", "echo out; echo err >&2; exit 7"), sink).unwrap();
        assert!(process.pid().is_some());

        let (tx, rx) = oneshot::channel();
        let control = process.observe(move |exit| {
            let _ = tx.send(exit);
        });

        let exit = rx.await.unwrap();
        assert_eq!(exit.code, Some(7));
        assert!(!exit.success);

        let mut watch = control.exit_watch();
        assert!(wait_for_exit(&mut watch, Duration::from_secs(1)).await);

        // Output forwarding runs on its own tasks; give them a moment to drain.
        for _ in 0..50 {
            if buffer.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let entries = buffer.recent(10);
        assert!(entries
            .iter()
            .any(|e| e.message == "out" && e.level == LogLevel::Info && e.source == "w"));
        assert!(entries
            .iter()
            .any(|e| e.message == "err" && e.level == LogLevel::Warn));
    }

    #[tokio::test]
    async fn test_spawn_passes_environment() {
        let buffer = Arc::new(LogBuffer::new(10));
        let sink: Arc<dyn LogSink> = buffer.clone();
        let config = WorkerConfig::new("env", ["sh", "-c", "echo \"$WORKER_PORT:$MODE\""], 8123)
            .with_env("MODE", "fast")
            .with_port_env("WORKER_PORT");

        let process = WorkerProcess::spawn(&config, sink).unwrap();
        let control = process.observe(|_| {});
        let mut watch = control.exit_watch();
        assert!(wait_for_exit(&mut watch, Duration::from_secs(2)).await);

        for _ in 0..50 {
            if !buffer.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(buffer.recent(1)[0].message, "8123:fast");
    }

    #[tokio::test]
    async fn test_force_kill_ends_process() {
        let sink: Arc<dyn LogSink> = Arc::new(LogBuffer::new(10));
        let process = WorkerProcess::spawn(&shell("sleeper", "exec sleep 30"), sink).unwrap();
        let mut control = process.observe(|_| {});
        let mut watch = control.exit_watch();

        assert!(!wait_for_exit(&mut watch, Duration::from_millis(100)).await);
        assert!(control.force_kill());
        assert!(!control.force_kill());
        assert!(wait_for_exit(&mut watch, Duration::from_secs(2)).await);
        assert_eq!(watch.borrow().map(|e| e.success), Some(false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_sends_sigterm() {
        let sink: Arc<dyn LogSink> = Arc::new(LogBuffer::new(10));
        let process = WorkerProcess::spawn(&shell("sleeper", "exec sleep 30"), sink).unwrap();
        let control = process.observe(|_| {});
        let mut watch = control.exit_watch();

        control.terminate().unwrap();
        assert!(wait_for_exit(&mut watch, Duration::from_secs(2)).await);
        // Killed by signal: no exit code.
        assert_eq!(watch.borrow().and_then(|e| e.code), None);
    }
}
