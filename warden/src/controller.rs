//! Daemon process lifecycle

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use warden_clock::Clock;
use warden_tokens::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    refresher::TokenRefresher,
    store::{StorageError, TokenStore},
    ConnectionMaintainer, MaintenanceSummary,
};

use crate::{
    pidfile::{PidFile, PidFileError},
    probe::{ProbeError, ProcessProbe, SystemProbe},
};

/// The lifecycle state of a controller in this process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonState {
    /// No loop is running
    Stopped,
    /// Claiming the PID file
    Starting,
    /// The maintenance loop is running
    Running,
    /// The loop has exited and the PID file is being released
    Stopping,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
        })
    }
}

/// Whether a daemon is running, as seen through the PID file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonStatus {
    /// The PID file names a live process
    Running {
        /// The daemon's process ID
        pid: u32,
    },
    /// There is no PID file, or it names a process that no longer exists
    Stopped,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DaemonStatus::Running { pid } => write!(f, "running (pid {pid})"),
            DaemonStatus::Stopped => f.write_str("not running"),
        }
    }
}

/// An error controlling the daemon
#[derive(Debug, Error)]
pub enum ControlError {
    /// Another live process holds the PID file
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning {
        /// The running daemon's process ID
        pid: u32,
    },
    /// The PID file kept changing while this process tried to claim it
    #[error("pid file kept changing; gave up claiming it after {attempts} attempts")]
    ClaimContended {
        /// How many times the claim was tried
        attempts: u32,
    },
    /// There is no daemon to stop
    #[error("daemon is not running")]
    NotRunning,
    /// The daemon did not exit in time
    #[error("daemon with pid {pid} did not stop within {timeout:?}")]
    StopTimedOut {
        /// The daemon's process ID
        pid: u32,
        /// How long we waited
        timeout: Duration,
    },
    /// The PID file could not be used
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    /// Another process could not be probed or signalled
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

const CLAIM_ATTEMPTS: u32 = 3;

/// Timing for the maintenance loop and for `stop`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// The pause between successful passes
    pub interval: Duration,
    /// The pauses after failed passes
    pub backoff: ErrorBackoffConfig,
    /// How long `stop` waits for the daemon to exit
    pub stop_timeout: Duration,
    /// How often `stop` checks whether the daemon has exited
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    /// Passes every 15 minutes, with failures retried after 60 seconds, doubling
    /// up to the interval. `stop` waits up to 30 seconds, checking every 250
    /// milliseconds.
    fn default() -> Self {
        let interval = Duration::from_secs(15 * 60);
        Self {
            interval,
            backoff: ErrorBackoffConfig::new(Duration::from_secs(60), interval, 2),
            stop_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// One unit of work repeated by the daemon loop
#[async_trait]
pub trait MaintenancePass: Send + Sync {
    /// Runs a single pass, returning early once `cancel` fires
    async fn run_pass(&self, cancel: &CancellationToken)
        -> Result<MaintenanceSummary, StorageError>;
}

#[async_trait]
impl<S, R, C> MaintenancePass for ConnectionMaintainer<S, R, C>
where
    S: TokenStore,
    R: TokenRefresher,
    C: Clock + Send + Sync,
{
    async fn run_pass(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MaintenanceSummary, StorageError> {
        self.maintain_until_cancelled(cancel).await
    }
}

#[async_trait]
impl<M: MaintenancePass + ?Sized> MaintenancePass for Arc<M> {
    async fn run_pass(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MaintenanceSummary, StorageError> {
        (**self).run_pass(cancel).await
    }
}

/// Runs the maintenance loop as the single instance named by a PID file,
/// and controls such an instance from another process
#[derive(Debug)]
pub struct DaemonController<P = SystemProbe> {
    pid_file: PidFile,
    probe: P,
    pid: u32,
    config: ControllerConfig,
    state: watch::Sender<DaemonState>,
}

impl DaemonController<SystemProbe> {
    /// Constructs a controller for the current process
    pub fn new(pid_file: PidFile, config: ControllerConfig) -> Self {
        Self {
            pid_file,
            probe: SystemProbe,
            pid: std::process::id(),
            config,
            state: watch::Sender::new(DaemonState::Stopped),
        }
    }
}

impl<P> DaemonController<P> {
    /// Sets the probe used to check on and signal other processes
    ///
    /// Useful for testing purposes
    pub fn with_probe<Q>(self, probe: Q) -> DaemonController<Q> {
        DaemonController {
            pid_file: self.pid_file,
            probe,
            pid: self.pid,
            config: self.config,
            state: self.state,
        }
    }

    /// Sets the process ID written to the PID file
    ///
    /// Useful for testing purposes
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Gets the current lifecycle state of this controller
    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    /// Gets the PID file
    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    fn set_state(&self, state: DaemonState) {
        self.state.send_replace(state);
        tracing::trace!(%state, "daemon state changed");
    }
}

impl<P: ProcessProbe> DaemonController<P> {
    /// Reports whether a daemon is running, without changing anything
    pub async fn status(&self) -> Result<DaemonStatus, ControlError> {
        match self.pid_file.read().await? {
            Some(pid) if self.probe.is_alive(pid)? => Ok(DaemonStatus::Running { pid }),
            _ => Ok(DaemonStatus::Stopped),
        }
    }

    /// Runs `pass` every interval until `cancel` fires
    ///
    /// Refuses to start while another live process holds the PID file. A PID
    /// file left behind by a dead process, or one that does not hold a PID, is
    /// replaced. The file is only ever created when absent, so of several
    /// instances starting at once exactly one claims it. The PID file is
    /// removed on the way out, unless another instance has taken it over.
    pub async fn start<M>(&self, pass: &M, cancel: &CancellationToken) -> Result<(), ControlError>
    where
        M: MaintenancePass + ?Sized,
    {
        let claimed = self.state.send_if_modified(|state| {
            if *state == DaemonState::Stopped {
                *state = DaemonState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ControlError::AlreadyRunning { pid: self.pid });
        }

        if let Err(error) = self.claim_pid_file().await {
            self.set_state(DaemonState::Stopped);
            return Err(error);
        }

        self.set_state(DaemonState::Running);
        tracing::info!(
            pid = self.pid,
            interval_secs = self.config.interval.as_secs(),
            "daemon started"
        );

        self.run_loop(pass, cancel).await;

        self.set_state(DaemonState::Stopping);
        let released = self.pid_file.remove_if_owned(self.pid).await;
        self.set_state(DaemonState::Stopped);
        tracing::info!(pid = self.pid, "daemon stopped");

        released?;
        Ok(())
    }

    async fn claim_pid_file(&self) -> Result<(), ControlError> {
        let _claim = self.pid_file.lock_claim().await?;

        for _ in 0..CLAIM_ATTEMPTS {
            if self.pid_file.create(self.pid).await? {
                return Ok(());
            }

            match self.pid_file.read().await {
                Ok(Some(pid)) if pid != self.pid && self.probe.is_alive(pid)? => {
                    tracing::error!(pid, "another daemon is already running");
                    return Err(ControlError::AlreadyRunning { pid });
                }
                // Our own ID here was recycled from a previous boot
                Ok(Some(pid)) => {
                    tracing::warn!(stale_pid = pid, "replacing stale pid file");
                    self.pid_file.remove_if_owned(pid).await?;
                }
                Ok(None) => {}
                Err(PidFileError::Malformed { contents, .. }) => {
                    tracing::warn!(%contents, "replacing malformed pid file");
                    self.pid_file.remove_if_contains(&contents).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(ControlError::ClaimContended {
            attempts: CLAIM_ATTEMPTS,
        })
    }

    async fn run_loop<M>(&self, pass: &M, cancel: &CancellationToken)
    where
        M: MaintenancePass + ?Sized,
    {
        let mut backoff = ErrorBackoffHandler::new(self.config.backoff.clone());

        while !cancel.is_cancelled() {
            let delay = match pass.run_pass(cancel).await.with_backoff(&mut backoff) {
                Ok(summary) => {
                    tracing::debug!(%summary, "maintenance pass finished");
                    self.config.interval
                }
                Err((error, delay)) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        consecutive_errors = backoff.consecutive_errors(),
                        delay_secs = delay.as_secs(),
                        "maintenance pass failed, will retry"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("cancellation requested; leaving maintenance loop");
    }

    /// Asks the running daemon to stop and waits for it to exit
    ///
    /// Returns the stopped daemon's process ID.
    pub async fn stop(&self) -> Result<u32, ControlError> {
        let pid = match self.pid_file.read().await? {
            Some(pid) if self.probe.is_alive(pid)? => pid,
            Some(pid) => {
                tracing::info!(stale_pid = pid, "pid file names a process that has exited");
                return Err(ControlError::NotRunning);
            }
            None => return Err(ControlError::NotRunning),
        };

        self.probe.terminate(pid)?;
        tracing::info!(pid, "asked daemon to stop");

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        loop {
            match self.pid_file.read().await? {
                Some(current) if current == pid && self.probe.is_alive(pid)? => {}
                _ => {
                    tracing::info!(pid, "daemon has stopped");
                    return Ok(pid);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::StopTimedOut {
                    pid,
                    timeout: self.config.stop_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stops any running daemon, then starts in its place
    pub async fn restart<M>(&self, pass: &M, cancel: &CancellationToken) -> Result<(), ControlError>
    where
        M: MaintenancePass + ?Sized,
    {
        match self.stop().await {
            Ok(pid) => tracing::info!(pid, "previous daemon stopped; starting"),
            Err(ControlError::NotRunning) => tracing::info!("no daemon was running; starting"),
            Err(error) => return Err(error),
        }

        self.start(pass, cancel).await
    }
}
