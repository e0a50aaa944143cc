//! The PID file shared with process supervisors
//!
//! The file holds the decimal process ID of the running daemon followed by a
//! newline. It is replaced atomically by writing a sibling temporary file and
//! renaming it over the target. A new file is created by hard-linking such a
//! temporary file into place, which fails if the target already exists, so
//! only one of several racing writers can create it and readers never see a
//! partly written file. Instances deciding whether to replace a stale file
//! hold an advisory lock on a sibling `.lock` file while they do so.

use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};

/// An error reading or writing the PID file
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The file could not be read, written, or removed
    #[error("unable to access pid file {}", path.display())]
    Io {
        /// The file being accessed
        path: PathBuf,
        /// The underlying error
        #[source]
        source: io::Error,
    },
    /// The file exists but does not hold a process ID
    #[error("pid file {} does not contain a process id: {contents:?}", path.display())]
    Malformed {
        /// The file being read
        path: PathBuf,
        /// What was found instead
        contents: String,
    },
}

/// Serializes the claims of instances starting against the same PID file
///
/// Released when dropped, or when the process exits.
pub struct ClaimLock {
    #[cfg(unix)]
    _locked: nix::fcntl::Flock<std::fs::File>,
}

impl fmt::Debug for ClaimLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimLock").finish_non_exhaustive()
    }
}

/// A PID file at a fixed path
#[derive(Clone, Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Refers to the PID file at `path`; nothing is touched on disk
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Gets the path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn temp_path(&self, pid: u32) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{pid}.tmp"));
        PathBuf::from(name)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Waits for exclusive use of the claim lock
    ///
    /// The lock file is created if needed and never removed.
    #[cfg(unix)]
    pub async fn lock_claim(&self) -> Result<ClaimLock, PidFileError> {
        use std::os::unix::fs::OpenOptionsExt;

        use nix::fcntl::{Flock, FlockArg};

        let path = self.lock_path();
        let locked = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .mode(0o600)
                .open(&path)?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_file, errno)| io::Error::from(errno))
        })
        .await
        .map_err(io::Error::other)
        .and_then(|locked| locked)
        .map_err(|e| PidFileError::Io {
            path: self.lock_path(),
            source: e,
        })?;

        Ok(ClaimLock { _locked: locked })
    }

    /// Without flock only the exclusive create in [`PidFile::create`] guards
    /// the claim
    #[cfg(not(unix))]
    pub async fn lock_claim(&self) -> Result<ClaimLock, PidFileError> {
        Ok(ClaimLock {})
    }

    /// Reads the recorded process ID, if the file exists
    pub async fn read(&self) -> Result<Option<u32>, PidFileError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };

        contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| PidFileError::Malformed {
                path: self.path.clone(),
                contents,
            })
    }

    async fn write_temp(&self, temp: &Path, pid: u32) -> Result<(), PidFileError> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(temp).await.map_err(|e| self.io_error(e))?;
        file.write_all(format!("{pid}\n").as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Records `pid`, replacing whatever the file held before
    pub async fn write(&self, pid: u32) -> Result<(), PidFileError> {
        let temp = self.temp_path(pid);
        if let Err(error) = self.write_temp(&temp, pid).await {
            let _ = fs::remove_file(&temp).await;
            return Err(error);
        }

        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        tracing::debug!(pid, path = %self.path.display(), "wrote pid file");
        Ok(())
    }

    /// Records `pid` only if there is no file yet
    ///
    /// Returns `false`, leaving the existing file untouched, if another
    /// process got there first.
    pub async fn create(&self, pid: u32) -> Result<bool, PidFileError> {
        let temp = self.temp_path(pid);
        let linked = match self.write_temp(&temp, pid).await {
            Ok(()) => fs::hard_link(&temp, &self.path).await,
            Err(error) => {
                let _ = fs::remove_file(&temp).await;
                return Err(error);
            }
        };
        let _ = fs::remove_file(&temp).await;

        match linked {
            Ok(()) => {
                tracing::debug!(pid, path = %self.path.display(), "created pid file");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(self.io_error(err)),
        }
    }

    /// Removes the file, returning whether it existed
    pub async fn remove(&self) -> Result<bool, PidFileError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.io_error(err)),
        }
    }

    /// Removes the file only if it still holds exactly `contents`
    ///
    /// Used to clear out a malformed file without deleting one that another
    /// instance has written in the meantime.
    pub async fn remove_if_contains(&self, contents: &str) -> Result<bool, PidFileError> {
        match fs::read_to_string(&self.path).await {
            Ok(current) if current == contents => self.remove().await,
            Ok(_) => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.io_error(err)),
        }
    }

    /// Removes the file only if it still names `pid`
    ///
    /// A file rewritten by another instance is left alone.
    pub async fn remove_if_owned(&self, pid: u32) -> Result<bool, PidFileError> {
        match self.read().await {
            Ok(Some(recorded)) if recorded == pid => self.remove().await,
            Ok(Some(recorded)) => {
                tracing::warn!(
                    pid,
                    recorded,
                    "pid file names another process; leaving it in place"
                );
                Ok(false)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
