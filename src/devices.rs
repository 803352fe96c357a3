//! Stdio endpoint devices for child processes. A device owns the file
//! descriptors for one kind of process input or output and hides the
//! details of wiring them up: [`File`] hands a path's descriptor to the
//! child, [`DataWriter`] feeds an in-memory payload into a child's stdin,
//! and [`DataReader`] collects child output into memory. Background
//! reader/writer threads prevent the classic pipe deadlock when a caller
//! both feeds and collects data from the same pipeline.

use crate::errors::{Error, Result, StatusMsg};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fmt;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

// returns (read_end_fd, write_end_fd) of a pipe with CLOEXEC flag set.
// Descriptors dup2()ed onto the stdio slots lose the flag, so anything
// not part of a child's final stdio triple closes itself at exec.
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut flags = OFlag::empty();
    flags.set(OFlag::O_CLOEXEC, true);
    Ok(pipe2(flags)?)
}

/// Which end of a device a child process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// The child reads from the device (stdin).
    Read,
    /// The child writes to the device (stdout/stderr).
    Write,
}

/// Capability set shared by all device variants. Descriptors are obtained
/// eagerly, before any fork; `bind` yields the descriptor a child will
/// inherit, `post_spawn` drops the parent's copies of child-side ends,
/// `post_start` launches any background I/O, and `close` releases
/// everything idempotently.
pub(crate) trait DevOps: fmt::Display + Send + Sync {
    fn bind(&self, role: Role) -> Result<RawFd>;
    fn post_spawn(&self);
    fn post_start(&self);
    fn close(&self) -> Result<()>;
    /// Release the single binding identified by the descriptor `bind`
    /// returned. Devices that bind once release everything; a multi-bound
    /// device must leave its other bindings untouched so that releasing
    /// one never waits on a process that is still running.
    fn close_binding(&self, _token: RawFd) -> Result<()> {
        self.close()
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> std::sync::MutexGuard<'a, T> {
    m.lock()
        .unwrap_or_else(|_| panic!("Should have locked {what} without poisoning"))
}

/// File mode for a [`File`] device: `r`, `w`, or `a`, with an optional
/// no-op `b` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileMode {
    Read,
    Write,
    Append,
}

pub(crate) fn parse_mode(mode: &str, allow_append: bool) -> Result<FileMode> {
    let base = mode.strip_suffix('b').unwrap_or(mode);
    let parsed = match base {
        "r" => Some(FileMode::Read),
        "w" => Some(FileMode::Write),
        "a" if allow_append => Some(FileMode::Append),
        _ => None,
    };
    parsed.ok_or_else(|| {
        let expect = if allow_append {
            "'r', 'w', or 'a'"
        } else {
            "'r' or 'w'"
        };
        Error::Config(format!(
            "invalid mode: '{mode}', expected {expect} with optional 'b' suffix"
        ))
    })
}

struct FileInner {
    path: PathBuf,
    mode: FileMode,
    fd: Mutex<Option<OwnedFd>>,
}

/// A file path used for process input or output. The descriptor is opened
/// eagerly at construction and closed by the parent once it has been
/// handed to the child.
///
/// ```no_run
/// # use pipework::{File, Pipeline};
/// # fn example() -> pipework::Result<()> {
/// let log = File::open("build.log", "a")?;
/// Pipeline::builder().cmd(["make"]).stderr(log).build()?.wait()?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct File {
    inner: Arc<FileInner>,
}

impl File {
    /// Opens `path` with a standard `r`, `w`, or `a` mode. A trailing `b`
    /// is accepted and ignored.
    pub fn open(path: impl AsRef<Path>, mode: &str) -> Result<File> {
        let path = path.as_ref().to_path_buf();
        let mode = parse_mode(mode, true)?;
        let mut opts = std::fs::File::options();
        match mode {
            FileMode::Read => opts.read(true),
            FileMode::Write => opts.write(true).create(true).truncate(true),
            FileMode::Append => opts.write(true).create(true).append(true),
        };
        let file = opts.open(&path)?;
        Ok(File {
            inner: Arc::new(FileInner {
                path,
                mode,
                fd: Mutex::new(Some(file.into())),
            }),
        })
    }

    pub(crate) fn as_dev(&self) -> Arc<dyn DevOps> {
        self.inner.clone()
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("path", &self.inner.path)
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for FileInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl DevOps for FileInner {
    fn bind(&self, role: Role) -> Result<RawFd> {
        let compatible = match role {
            Role::Read => self.mode == FileMode::Read,
            Role::Write => self.mode != FileMode::Read,
        };
        if !compatible {
            return Err(Error::Config(format!(
                "cannot bind {} for {}: opened with the opposite mode",
                self.path.display(),
                match role {
                    Role::Read => "reading",
                    Role::Write => "writing",
                }
            )));
        }
        match lock(&self.fd, "File descriptor").as_ref() {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(Error::Config(format!(
                "cannot bind {}: already closed",
                self.path.display()
            ))),
        }
    }

    fn post_spawn(&self) {
        // the child holds its own copy now
        lock(&self.fd, "File descriptor").take();
    }

    fn post_start(&self) {}

    fn close(&self) -> Result<()> {
        lock(&self.fd, "File descriptor").take();
        Ok(())
    }
}

struct CapturePipe {
    // write-end descriptor value at bind time, identifying the binding
    // even after the descriptor itself is gone
    id: RawFd,
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
    thread: Option<JoinHandle<()>>,
}

impl CapturePipe {
    fn release(&mut self) {
        self.read.take();
        self.write.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::warn!("DataReader thread panicked during close");
            }
        }
    }
}

#[derive(Default)]
struct ReaderState {
    pipes: Vec<CapturePipe>,
}

struct ReaderInner {
    state: Mutex<ReaderState>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

/// Collects process output into memory via a pipe and a background reader
/// thread. One pipe (and one thread) is created per bound process, so a
/// single instance may capture stderr from every stage of a pipeline;
/// each thread appends to the same lock-protected buffer. No ordering is
/// guaranteed between the output of different stages.
///
/// ```no_run
/// # use pipework::{DataReader, Pipeline};
/// # fn example() -> pipework::Result<()> {
/// let out = DataReader::new();
/// Pipeline::builder().cmd(["ls", "-1"]).stdout(&out).build()?.wait()?;
/// for line in out.data().lines() {
///     println!("{line}");
/// }
/// # Ok(()) }
/// ```
#[derive(Clone, Default)]
pub struct DataReader {
    inner: Arc<ReaderInner>,
}

impl Default for ReaderInner {
    fn default() -> Self {
        ReaderInner {
            state: Mutex::new(ReaderState::default()),
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl DataReader {
    pub fn new() -> DataReader {
        DataReader::default()
    }

    /// Buffered data as text, with invalid UTF-8 replaced. Complete once
    /// the owning pipeline has been waited on.
    pub fn data(&self) -> String {
        String::from_utf8_lossy(&lock(&self.inner.buffer, "DataReader buffer")).into_owned()
    }

    /// Buffered data as raw bytes.
    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.inner.buffer, "DataReader buffer").clone()
    }

    pub(crate) fn as_dev(&self) -> Arc<dyn DevOps> {
        self.inner.clone()
    }
}

impl fmt::Display for DataReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Display for ReaderInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[DataReader]")
    }
}

impl DevOps for ReaderInner {
    fn bind(&self, role: Role) -> Result<RawFd> {
        if role == Role::Read {
            return Err(Error::Config(
                "cannot use a DataReader for process input".into(),
            ));
        }
        let (read, write) = cloexec_pipe()?;
        let fd = write.as_raw_fd();
        lock(&self.state, "DataReader state").pipes.push(CapturePipe {
            id: fd,
            read: Some(read),
            write: Some(write),
            thread: None,
        });
        Ok(fd)
    }

    fn post_spawn(&self) {
        // drop the write ends so EOF arrives when the children exit
        for pipe in lock(&self.state, "DataReader state").pipes.iter_mut() {
            pipe.write.take();
        }
    }

    fn post_start(&self) {
        for pipe in lock(&self.state, "DataReader state").pipes.iter_mut() {
            if let Some(fd) = pipe.read.take() {
                let buffer = Arc::clone(&self.buffer);
                pipe.thread = Some(std::thread::spawn(move || reader_thread(fd, buffer)));
            }
        }
    }

    fn close(&self) -> Result<()> {
        for pipe in lock(&self.state, "DataReader state").pipes.iter_mut() {
            pipe.release();
        }
        Ok(())
    }

    /// Join only the capture thread feeding from the exited process. The
    /// other bindings may still have live writers, so touching them here
    /// would turn a non-blocking poll into a wait.
    fn close_binding(&self, token: RawFd) -> Result<()> {
        let mut state = lock(&self.state, "DataReader state");
        if let Some(pipe) = state.pipes.iter_mut().find(|p| p.id == token) {
            pipe.release();
        }
        Ok(())
    }
}

fn reader_thread(fd: OwnedFd, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut file = std::fs::File::from(fd);
    let mut chunk = [0u8; 8192];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => lock(&buffer, "DataReader buffer").extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("DataReader read failed: {e}");
                break;
            }
        }
    }
}

struct WriterState {
    payload: Option<Vec<u8>>,
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
    bound: bool,
    thread: Option<JoinHandle<()>>,
}

struct WriterInner {
    state: Mutex<WriterState>,
}

/// Feeds a fixed in-memory payload into a process via a pipe and a
/// background writer thread. The thread pushes the payload, closes the
/// pipe, and tolerates a broken pipe if the reader exited early. An
/// instance binds to exactly one process.
///
/// ```no_run
/// # use pipework::{DataReader, DataWriter, Pipeline};
/// # fn example() -> pipework::Result<()> {
/// let out = DataReader::new();
/// Pipeline::builder()
///     .cmd(["sort", "-r"])
///     .stdin(DataWriter::new("one\ntwo\nthree\n")?)
///     .stdout(&out)
///     .build()?
///     .wait()?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct DataWriter {
    inner: Arc<WriterInner>,
}

impl DataWriter {
    pub fn new(data: impl Into<Vec<u8>>) -> Result<DataWriter> {
        let (read, write) = cloexec_pipe()?;
        Ok(DataWriter {
            inner: Arc::new(WriterInner {
                state: Mutex::new(WriterState {
                    payload: Some(data.into()),
                    read: Some(read),
                    write: Some(write),
                    bound: false,
                    thread: None,
                }),
            }),
        })
    }

    pub(crate) fn as_dev(&self) -> Arc<dyn DevOps> {
        self.inner.clone()
    }
}

impl fmt::Display for DataWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Display for WriterInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[DataWriter]")
    }
}

impl DevOps for WriterInner {
    fn bind(&self, role: Role) -> Result<RawFd> {
        if role == Role::Write {
            return Err(Error::Config(
                "cannot use a DataWriter for process output".into(),
            ));
        }
        let mut state = lock(&self.state, "DataWriter state");
        if state.bound {
            return Err(Error::Config("DataWriter already bound to a process".into()));
        }
        let fd = match state.read.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(Error::Config("cannot bind DataWriter: already closed".into())),
        };
        state.bound = true;
        Ok(fd)
    }

    fn post_spawn(&self) {
        // the child holds the read end now
        lock(&self.state, "DataWriter state").read.take();
    }

    fn post_start(&self) {
        let mut state = lock(&self.state, "DataWriter state");
        let (Some(fd), Some(payload)) = (state.write.take(), state.payload.take()) else {
            return;
        };
        state.thread = Some(std::thread::spawn(move || writer_thread(fd, payload)));
    }

    fn close(&self) -> Result<()> {
        let mut state = lock(&self.state, "DataWriter state");
        if let Some(handle) = state.thread.take() {
            if handle.join().is_err() {
                log::warn!("DataWriter thread panicked during close");
            }
        }
        state.read.take();
        state.write.take();
        Ok(())
    }
}

fn writer_thread(fd: OwnedFd, payload: Vec<u8>) {
    let mut file = std::fs::File::from(fd);
    match file.write_all(&payload) {
        Ok(()) => {}
        // a reader that exits early is the normal shell outcome
        Err(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
        Err(e) => log::warn!("DataWriter write failed: {e}"),
    }
}

/// Anonymous pipe joining the stdout of one pipeline stage to the stdin
/// of the next. The parent closes both ends right after spawn; the child
/// copies keep the pipe alive.
pub(crate) struct SiblingPipe {
    state: Mutex<PipeState>,
}

struct PipeState {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl SiblingPipe {
    pub(crate) fn new() -> Result<SiblingPipe> {
        let (read, write) = cloexec_pipe()?;
        Ok(SiblingPipe {
            state: Mutex::new(PipeState {
                read: Some(read),
                write: Some(write),
            }),
        })
    }
}

impl fmt::Display for SiblingPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Pipe]")
    }
}

impl DevOps for SiblingPipe {
    fn bind(&self, role: Role) -> Result<RawFd> {
        let state = lock(&self.state, "SiblingPipe state");
        let fd = match role {
            Role::Read => state.read.as_ref(),
            Role::Write => state.write.as_ref(),
        };
        match fd {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(Error::Config("sibling pipe end already closed".into())),
        }
    }

    fn post_spawn(&self) {
        let mut state = lock(&self.state, "SiblingPipe state");
        state.read.take();
        state.write.take();
    }

    fn post_start(&self) {}

    fn close(&self) -> Result<()> {
        let mut state = lock(&self.state, "SiblingPipe state");
        state.read.take();
        state.write.take();
        Ok(())
    }
}

/// One-way channel from child to parent, used only during spawn. Both
/// ends carry the close-on-exec flag, so the pipe closing without any
/// data is exactly the signal that the exec succeeded.
pub(crate) struct StatusChannel {
    read: Option<std::fs::File>,
    write: Option<std::fs::File>,
}

impl StatusChannel {
    pub(crate) fn new() -> Result<StatusChannel> {
        let (read, write) = cloexec_pipe()?;
        Ok(StatusChannel {
            read: Some(read.into()),
            write: Some(write.into()),
        })
    }

    pub(crate) fn child_after_fork(&mut self) {
        self.read.take();
    }

    pub(crate) fn parent_after_fork(&mut self) {
        self.write.take();
    }

    pub(crate) fn write_raw_fd(&self) -> Option<RawFd> {
        self.write.as_ref().map(|f| f.as_raw_fd())
    }

    /// Send one message; called only from the child, before exec.
    pub(crate) fn send(&mut self, msg: &StatusMsg) -> Result<()> {
        let Some(write) = self.write.as_mut() else {
            return Err(Error::Spawn("status channel write end closed".into()));
        };
        let mut buf = serde_json::to_vec(msg)
            .map_err(|e| Error::Spawn(format!("cannot encode status message: {e}")))?;
        buf.push(b'\n');
        write.write_all(&buf)?;
        write.flush()?;
        Ok(())
    }

    /// Receive one message, or `None` on EOF.
    pub(crate) fn recv(&mut self) -> Result<Option<StatusMsg>> {
        let Some(read) = self.read.as_mut() else {
            return Ok(None);
        };
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match read.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if line.is_empty() {
            return Ok(None);
        }
        let msg = serde_json::from_slice(&line)
            .map_err(|e| Error::Spawn(format!("unexpected data on status channel: {e}")))?;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(parse_mode("r", true).unwrap(), FileMode::Read);
        assert_eq!(parse_mode("wb", true).unwrap(), FileMode::Write);
        assert_eq!(parse_mode("a", true).unwrap(), FileMode::Append);
        assert!(parse_mode("a", false).is_err());
        let err = parse_mode("x", true).unwrap_err();
        assert!(err.to_string().contains("invalid mode: 'x'"));
    }

    #[test]
    fn writer_binds_once() {
        let writer = DataWriter::new("data").unwrap();
        let dev = writer.as_dev();
        dev.bind(Role::Read).unwrap();
        let err = dev.bind(Role::Read).unwrap_err();
        assert!(err.to_string().contains("already bound to a process"));
    }

    #[test]
    fn reader_binds_many() {
        let reader = DataReader::new();
        let dev = reader.as_dev();
        let a = dev.bind(Role::Write).unwrap();
        let b = dev.bind(Role::Write).unwrap();
        assert_ne!(a, b);
        dev.close().unwrap();
        dev.close().unwrap();
    }

    #[test]
    fn releasing_one_binding_keeps_the_others() {
        let reader = DataReader::new();
        let dev = reader.as_dev();
        let first = dev.bind(Role::Write).unwrap();
        let second = dev.bind(Role::Write).unwrap();
        dev.close_binding(first).unwrap();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(second) };
        nix::unistd::write(borrowed, b"kept\n").unwrap();
        dev.post_spawn();
        dev.post_start();
        dev.close().unwrap();
        assert_eq!(reader.data(), "kept\n");
    }

    #[test]
    fn reader_rejects_input_role() {
        let reader = DataReader::new();
        assert!(reader.as_dev().bind(Role::Read).is_err());
    }

    #[test]
    fn status_channel_eof_is_none() {
        let mut chan = StatusChannel::new().unwrap();
        chan.parent_after_fork();
        assert!(chan.recv().unwrap().is_none());
    }

    #[test]
    fn status_channel_carries_failure() {
        let mut chan = StatusChannel::new().unwrap();
        chan.send(&StatusMsg::Failed(crate::errors::SpawnFailure {
            message: "no such file".into(),
            errno: Some(2),
        }))
        .unwrap();
        chan.parent_after_fork();
        match chan.recv().unwrap() {
            Some(StatusMsg::Failed(f)) => {
                assert_eq!(f.errno, Some(2));
                assert_eq!(f.message, "no such file");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
