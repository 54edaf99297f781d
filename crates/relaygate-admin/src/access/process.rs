//! Control of the managed relay process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::AdminError;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("A relay restart is already in progress")]
    RestartInProgress,

    #[error("Invalid pid file {path}: {reason}")]
    PidFile { path: String, reason: String },

    #[error("Failed to signal relay process {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error("No restart command configured")]
    NoRestartCommand,

    #[error("Failed to start relay: {0}")]
    Spawn(String),

    #[error("Relay process {0} did not exit in time")]
    StopTimeout(i32),
}

impl From<ProcessError> for AdminError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::RestartInProgress => Self::Conflict(e.to_string()),
            other => Self::TransientExternal(other.to_string()),
        }
    }
}

/// Narrow view of the relay process supervisor.
#[async_trait]
pub trait RelayProcess: Send + Sync + 'static {
    /// Ask the relay to re-read its policy. A stopped relay is not an error.
    async fn reload(&self) -> Result<(), ProcessError>;

    async fn restart(&self) -> Result<(), ProcessError>;

    async fn is_running(&self) -> bool;
}

/// Used when no relay process is configured.
pub struct DetachedRelay;

#[async_trait]
impl RelayProcess for DetachedRelay {
    async fn reload(&self) -> Result<(), ProcessError> {
        debug!("No relay process configured; skipping reload");
        Ok(())
    }

    async fn restart(&self) -> Result<(), ProcessError> {
        Err(ProcessError::NoRestartCommand)
    }

    async fn is_running(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum RelaySignal {
    Probe,
    Reload,
    Terminate,
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: RelaySignal) -> Result<(), ProcessError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let sig = match signal {
        RelaySignal::Probe => None,
        RelaySignal::Reload => Some(Signal::SIGHUP),
        RelaySignal::Terminate => Some(Signal::SIGTERM),
    };
    kill(Pid::from_raw(pid), sig).map_err(|e| ProcessError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_signal(pid: i32, _signal: RelaySignal) -> Result<(), ProcessError> {
    Err(ProcessError::Signal {
        pid,
        reason: "signals are not supported on this platform".into(),
    })
}

/// Clears the restart flag when the restart finishes, however it ends.
struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Relay process located through its pid file and driven with signals.
pub struct PidFileProcess {
    pid_file: PathBuf,
    restart_command: Vec<String>,
    stop_timeout: Duration,
    restarting: AtomicBool,
}

impl PidFileProcess {
    pub fn new(pid_file: impl Into<PathBuf>, restart_command: Vec<String>) -> Self {
        Self {
            pid_file: pid_file.into(),
            restart_command,
            stop_timeout: Duration::from_secs(10),
            restarting: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    fn read_pid(&self) -> Result<Option<i32>, ProcessError> {
        let raw = match std::fs::read_to_string(&self.pid_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProcessError::PidFile {
                    path: self.pid_file.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let pid = raw.trim().parse::<i32>().map_err(|e| ProcessError::PidFile {
            path: self.pid_file.display().to_string(),
            reason: e.to_string(),
        })?;
        if pid <= 0 {
            return Err(ProcessError::PidFile {
                path: self.pid_file.display().to_string(),
                reason: format!("pid {pid} out of range"),
            });
        }
        Ok(Some(pid))
    }

    /// Pid of the relay if its process is alive.
    fn running_pid(&self) -> Result<Option<i32>, ProcessError> {
        Ok(self
            .read_pid()?
            .filter(|pid| send_signal(*pid, RelaySignal::Probe).is_ok()))
    }

    fn begin_restart(&self) -> Result<RestartGuard<'_>, ProcessError> {
        self.restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ProcessError::RestartInProgress)?;
        Ok(RestartGuard(&self.restarting))
    }

    async fn wait_for_exit(&self, pid: i32) -> Result<(), ProcessError> {
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while send_signal(pid, RelaySignal::Probe).is_ok() {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::StopTimeout(pid));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RelayProcess for PidFileProcess {
    async fn reload(&self) -> Result<(), ProcessError> {
        let Some(pid) = self.running_pid()? else {
            debug!(pid_file = %self.pid_file.display(), "Relay not running; skipping reload");
            return Ok(());
        };

        send_signal(pid, RelaySignal::Reload)?;
        info!(pid, "Relay reload signalled");
        Ok(())
    }

    async fn restart(&self) -> Result<(), ProcessError> {
        let _guard = self.begin_restart()?;

        let Some((program, args)) = self.restart_command.split_first() else {
            return Err(ProcessError::NoRestartCommand);
        };

        if let Some(pid) = self.running_pid()? {
            send_signal(pid, RelaySignal::Terminate)?;
            self.wait_for_exit(pid).await?;
            info!(pid, "Relay process stopped");
        }

        let child = tokio::process::Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;

        match child.id() {
            Some(pid) => info!(pid, program = %program, "Relay process started"),
            None => warn!(program = %program, "Relay process exited immediately"),
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        matches!(self.running_pid(), Ok(Some(_)))
    }
}
