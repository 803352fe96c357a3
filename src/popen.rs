//! Streaming access to one end of a pipeline. [`Popen`] runs a pipeline
//! with either its last stage's stdout or its first stage's stdin
//! connected to a pipe held by the caller, who then reads or writes it
//! directly through [`std::io::Read`] / [`std::io::Write`].

use crate::devices::cloexec_pipe;
use crate::errors::{Error, Result};
use crate::pipeline::{IntoCommands, Pipeline};
use crate::process::Stdio;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The caller reads the last stage's stdout.
    Read,
    /// The caller writes the first stage's stdin.
    Write,
}

/// A running pipeline with one end held open by the caller.
///
/// ```no_run
/// # use pipework::Popen;
/// # use std::io::Read;
/// # fn example() -> pipework::Result<()> {
/// let mut child = Popen::reader([["zcat", "data.gz"]])?;
/// let mut text = String::new();
/// child.read_to_string(&mut text)?;
/// child.wait()?;
/// # Ok(()) }
/// ```
pub struct Popen {
    pipeline: Pipeline,
    handle: Option<std::fs::File>,
    direction: Direction,
}

impl Popen {
    /// Runs `cmds` with the last stage's stdout connected to this handle.
    pub fn reader(cmds: impl IntoCommands) -> Result<Popen> {
        Self::open(cmds, Stdio::Inherit, Direction::Read)
    }

    /// Like [`reader`](Self::reader), with an explicit stdin for the
    /// first stage. The stdout side is owned by the handle and cannot be
    /// redirected.
    pub fn reader_with_stdin(cmds: impl IntoCommands, stdin: impl Into<Stdio>) -> Result<Popen> {
        Self::open(cmds, stdin.into(), Direction::Read)
    }

    /// Runs `cmds` with the first stage's stdin connected to this handle.
    pub fn writer(cmds: impl IntoCommands) -> Result<Popen> {
        Self::open(cmds, Stdio::Inherit, Direction::Write)
    }

    /// Like [`writer`](Self::writer), with an explicit stdout for the
    /// last stage. The stdin side is owned by the handle and cannot be
    /// redirected.
    pub fn writer_with_stdout(cmds: impl IntoCommands, stdout: impl Into<Stdio>) -> Result<Popen> {
        Self::open(cmds, stdout.into(), Direction::Write)
    }

    fn open(cmds: impl IntoCommands, other: Stdio, direction: Direction) -> Result<Popen> {
        let (read_end, write_end) = cloexec_pipe()?;
        let (parent_end, child_end) = match direction {
            Direction::Read => (read_end, write_end),
            Direction::Write => (write_end, read_end),
        };
        let child_stdio = Stdio::Fd(child_end.as_raw_fd());
        let builder = Pipeline::builder().commands(cmds);
        let builder = match direction {
            Direction::Read => builder.stdin(other).stdout(child_stdio),
            Direction::Write => builder.stdin(child_stdio).stdout(other),
        };
        let mut pipeline = builder.build()?;
        pipeline.start()?;
        // the children hold their own copy of the child end now; ours
        // must go, or a reader would never see EOF
        drop(child_end);
        Ok(Popen {
            pipeline,
            handle: Some(parent_end.into()),
            direction,
        })
    }

    /// The underlying pipeline, for description or per-stage inspection.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Closes the caller's end and blocks until the pipeline finishes,
    /// reporting the first failure in pipeline order. The handle must
    /// close first: for a write-mode `Popen` the first stage is still
    /// waiting for EOF on its stdin.
    pub fn wait(&mut self) -> Result<()> {
        self.handle.take();
        self.pipeline.wait()
    }

    /// Same as [`wait`](Self::wait).
    pub fn close(&mut self) -> Result<()> {
        self.wait()
    }

    /// Not supported: the caller's handle has to be drained or closed for
    /// the pipeline to finish, so only the blocking [`wait`](Self::wait)
    /// is meaningful.
    pub fn poll(&mut self) -> Result<bool> {
        Err(Error::Config("Popen does not support poll()".into()))
    }
}

impl Read for Popen {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.direction != Direction::Read {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot read from a write-mode Popen",
            ));
        }
        match self.handle.as_mut() {
            Some(handle) => handle.read(buf),
            None => Ok(0),
        }
    }
}

impl Write for Popen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.direction != Direction::Write {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot write to a read-mode Popen",
            ));
        }
        match self.handle.as_mut() {
            Some(handle) => handle.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Popen already closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.flush(),
            None => Ok(()),
        }
    }
}
