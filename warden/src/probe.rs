//! Asking the operating system about other processes

use thiserror::Error;

/// An error probing or signalling a process
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The process ID cannot name a single process
    #[error("{0} is not a valid process id")]
    InvalidPid(u32),
    /// The operating system refused the request
    #[error("unable to signal process {pid}")]
    Signal {
        /// The process being signalled
        pid: u32,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// Signalling other processes is not possible on this platform
    #[error("terminating other processes is not supported on this platform")]
    Unsupported,
}

/// Checks and stops processes by ID
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this ID currently exists
    fn is_alive(&self, pid: u32) -> Result<bool, ProbeError>;

    /// Asks the process to shut down gracefully
    ///
    /// Returns as soon as the request is delivered; the process may take a
    /// while to exit.
    fn terminate(&self, pid: u32) -> Result<(), ProbeError>;
}

impl<P: ProcessProbe + ?Sized> ProcessProbe for std::sync::Arc<P> {
    fn is_alive(&self, pid: u32) -> Result<bool, ProbeError> {
        (**self).is_alive(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), ProbeError> {
        (**self).terminate(pid)
    }
}

/// Probes real processes through the operating system
///
/// On unix, liveness is checked by sending signal 0 and termination sends
/// `SIGTERM`. Elsewhere only the current process is known to be alive and
/// termination is unsupported.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

#[cfg(unix)]
mod imp {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    use super::ProbeError;

    fn to_pid(pid: u32) -> Result<Pid, ProbeError> {
        // 0 and negative values address process groups
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
            _ => Err(ProbeError::InvalidPid(pid)),
        }
    }

    fn signal_error(pid: u32, errno: Errno) -> ProbeError {
        ProbeError::Signal {
            pid,
            source: std::io::Error::from(errno),
        }
    }

    pub(super) fn is_alive(pid: u32) -> Result<bool, ProbeError> {
        match kill(to_pid(pid)?, None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            // exists, but belongs to another user
            Err(Errno::EPERM) => Ok(true),
            Err(errno) => Err(signal_error(pid, errno)),
        }
    }

    pub(super) fn terminate(pid: u32) -> Result<(), ProbeError> {
        match kill(to_pid(pid)?, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(signal_error(pid, errno)),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::ProbeError;

    pub(super) fn is_alive(pid: u32) -> Result<bool, ProbeError> {
        Ok(pid == std::process::id())
    }

    pub(super) fn terminate(_pid: u32) -> Result<(), ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> Result<bool, ProbeError> {
        imp::is_alive(pid)
    }

    fn terminate(&self, pid: u32) -> Result<(), ProbeError> {
        imp::terminate(pid)
    }
}
