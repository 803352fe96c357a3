use nix::errno::Errno;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid stdio specification, file mode, or misuse of the API.
    /// Raised synchronously, before any process has been spawned.
    #[error("{0}")]
    Config(String),
    /// A process failed to exec, exited non-zero, or was terminated by a
    /// signal. Inspect the [`ProcessError`] for the details.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// The spawn protocol was violated, e.g. a child exited before
    /// establishing its process group.
    #[error("{0}")]
    Spawn(String),
    #[error(transparent)]
    Os(#[from] Errno),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Get the symbolic name for a signal number, e.g. `SIGSEGV`.
fn signal_name(num: i32) -> String {
    match Signal::try_from(num) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal{num}"),
    }
}

/// Failure of a single process in a pipeline. A `None` return code
/// indicates the failure happened before the program image was loaded.
/// A negative return code encodes the terminating signal.
#[derive(Debug, Clone)]
pub struct ProcessError {
    desc: String,
    returncode: Option<i32>,
    stderr: Option<String>,
    cause: Option<Arc<io::Error>>,
}

impl ProcessError {
    /// Failure from a decoded wait status.
    pub(crate) fn exit(desc: String, returncode: i32, stderr: Option<String>) -> Self {
        Self {
            desc,
            returncode: Some(returncode),
            stderr,
            cause: None,
        }
    }

    /// Reconstruct a spawn-time failure received over the status channel.
    pub(crate) fn spawn(desc: String, failure: SpawnFailure) -> Self {
        let cause = failure
            .errno
            .map(|e| Arc::new(io::Error::from_raw_os_error(e)));
        Self {
            desc,
            returncode: None,
            stderr: Some(failure.message),
            cause,
        }
    }

    /// Shell-quoted description of the failing process.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Exit code, or the negated terminating signal. `None` means the
    /// program image never loaded.
    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// The terminating signal, if the process was signaled.
    pub fn signal(&self) -> Option<Signal> {
        match self.returncode {
            Some(rc) if rc < 0 => Signal::try_from(-rc).ok(),
            _ => None,
        }
    }

    /// Captured stderr text, when the process had a `DataReader` on its
    /// stderr. For exec failures this holds the child-side error message.
    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.returncode {
            None => write!(f, "exec failed")?,
            Some(rc) if rc < 0 => write!(f, "process signaled: {}", signal_name(-rc))?,
            Some(rc) => write!(f, "process exited {rc}")?,
        }
        write!(f, ": {}", self.desc)?;
        if let Some(stderr) = &self.stderr {
            if !stderr.is_empty() {
                write!(f, ":\n{stderr}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Failure descriptor sent from child to parent over the status channel.
/// An exception cannot cross the process boundary, so the failure travels
/// as data and is rebuilt into a [`ProcessError`] in the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SpawnFailure {
    pub message: String,
    pub errno: Option<i32>,
}

impl SpawnFailure {
    pub(crate) fn from_error(err: &Error) -> Self {
        let errno = match err {
            Error::Os(errno) => Some(*errno as i32),
            Error::Io(ioerr) => ioerr.raw_os_error(),
            _ => None,
        };
        Self {
            message: err.to_string(),
            errno,
        }
    }
}

/// Messages carried by the status channel during spawn.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum StatusMsg {
    /// Sent by the first child once the process group is established.
    GroupReady,
    /// Pre-exec setup or the exec itself failed in the child.
    Failed(SpawnFailure),
}
