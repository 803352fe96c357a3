//! A single child program instance and the fork/exec spawn protocol.
//! The protocol has to get three things right at once: the child must
//! join the pipeline's process group before running user code, a failure
//! anywhere before the program image loads must reach the parent as data
//! over the status channel, and no descriptor may leak past the child's
//! final stdio triple.

use crate::devices::{DataReader, DevOps, File, Role, StatusChannel};
use crate::errors::{Error, ProcessError, Result, SpawnFailure, StatusMsg};
use nix::sys::signal::{SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, dup2, execvp, fork, ForkResult, Pid, SysconfVar};
use std::convert::Infallible;
use std::ffi::CString;
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

/// Specification for one of a process's stdio streams.
#[derive(Clone, Default)]
pub enum Stdio {
    /// The stream is inherited from the parent.
    #[default]
    Inherit,
    /// An explicit descriptor number. The caller retains ownership.
    Fd(RawFd),
    /// A filesystem path, opened for reading when used as stdin and for
    /// writing (truncating) when used as stdout or stderr.
    Path(PathBuf),
    /// An already-opened [`File`] device.
    File(File),
    /// Collect the stream into an in-memory [`DataReader`]. The same
    /// instance may serve several streams and several stages.
    Reader(DataReader),
    /// Feed the stream from an in-memory [`DataWriter`].
    Writer(crate::devices::DataWriter),
    /// Stderr only: auto-create one [`DataReader`] per stage, so every
    /// stage's stderr is captured and attached to its failure.
    Capture,
}

impl From<&DataReader> for Stdio {
    fn from(r: &DataReader) -> Stdio {
        Stdio::Reader(r.clone())
    }
}

impl From<DataReader> for Stdio {
    fn from(r: DataReader) -> Stdio {
        Stdio::Reader(r)
    }
}

impl From<&crate::devices::DataWriter> for Stdio {
    fn from(w: &crate::devices::DataWriter) -> Stdio {
        Stdio::Writer(w.clone())
    }
}

impl From<crate::devices::DataWriter> for Stdio {
    fn from(w: crate::devices::DataWriter) -> Stdio {
        Stdio::Writer(w)
    }
}

impl From<&File> for Stdio {
    fn from(f: &File) -> Stdio {
        Stdio::File(f.clone())
    }
}

impl From<File> for Stdio {
    fn from(f: File) -> Stdio {
        Stdio::File(f)
    }
}

impl From<&str> for Stdio {
    fn from(path: &str) -> Stdio {
        Stdio::Path(PathBuf::from(path))
    }
}

impl From<String> for Stdio {
    fn from(path: String) -> Stdio {
        Stdio::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for Stdio {
    fn from(path: PathBuf) -> Stdio {
        Stdio::Path(path)
    }
}

impl From<&std::path::Path> for Stdio {
    fn from(path: &std::path::Path) -> Stdio {
        Stdio::Path(path.to_path_buf())
    }
}

impl Stdio {
    /// Rendering used in pipeline descriptions, `None` when the stream is
    /// effectively inherited.
    pub(crate) fn describe(&self, inherit_fd: RawFd) -> Option<String> {
        match self {
            Stdio::Inherit => None,
            Stdio::Fd(fd) if *fd == inherit_fd => None,
            Stdio::Fd(fd) => Some(fd.to_string()),
            Stdio::Path(path) => Some(path.display().to_string()),
            Stdio::File(file) => Some(file.to_string()),
            Stdio::Reader(_) | Stdio::Capture => Some("[DataReader]".into()),
            Stdio::Writer(_) => Some("[DataWriter]".into()),
        }
    }
}

/// Resolved stdio binding for one stream of one process.
pub(crate) enum ProcStdio {
    Inherit,
    Fd(RawFd),
    Dev {
        dev: Arc<dyn DevOps>,
        child_fd: RawFd,
    },
}

/// Wiring input for one stream of one stage: either the caller's spec or
/// a sibling pipe inserted by the pipeline.
pub(crate) enum StageIo<'a> {
    Spec(&'a Stdio),
    Pipe(Arc<crate::devices::SiblingPipe>),
}

/// State of a child process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    Preinit,
    Startup,
    Running,
    Finished,
}

/// One child program instance within a pipeline.
pub struct Process {
    cmd: Vec<String>,
    argv: Vec<CString>,
    stdin: ProcStdio,
    stdout: ProcStdio,
    stderr: ProcStdio,
    stderr_capture: Option<DataReader>,
    pid: Option<Pid>,
    pgid: Option<Pid>,
    status: Option<StatusChannel>,
    state: ProcState,
    returncode: Option<i32>,
    failure: Option<ProcessError>,
    forced: bool,
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.cmd {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match shlex::try_quote(arg) {
                Ok(quoted) => write!(f, "{quoted}")?,
                Err(_) => write!(f, "{arg}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("cmd", &self.cmd)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("returncode", &self.returncode)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl Process {
    pub(crate) fn new(
        cmd: Vec<String>,
        stdin: StageIo<'_>,
        stdout: StageIo<'_>,
        stderr: &Stdio,
    ) -> Result<Process> {
        if cmd.is_empty() {
            return Err(Error::Config("command must have at least one argument".into()));
        }
        let argv = cmd
            .iter()
            .map(|arg| {
                CString::new(arg.as_str())
                    .map_err(|_| Error::Config(format!("argument contains NUL byte: {arg:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let stdin = Self::assoc_stage(stdin, Role::Read)?;
        let stdout = Self::assoc_stage(stdout, Role::Write)?;
        let (stderr, stderr_capture) = Self::assoc_stderr(stderr)?;
        Ok(Process {
            cmd,
            argv,
            stdin,
            stdout,
            stderr,
            stderr_capture,
            pid: None,
            pgid: None,
            status: None,
            state: ProcState::Preinit,
            returncode: None,
            failure: None,
            forced: false,
        })
    }

    fn assoc_stage(io: StageIo<'_>, role: Role) -> Result<ProcStdio> {
        match io {
            StageIo::Pipe(pipe) => {
                let child_fd = pipe.bind(role)?;
                Ok(ProcStdio::Dev {
                    dev: pipe,
                    child_fd,
                })
            }
            StageIo::Spec(spec) => Self::assoc(spec, role, false).map(|(io, _)| io),
        }
    }

    fn assoc_stderr(spec: &Stdio) -> Result<(ProcStdio, Option<DataReader>)> {
        Self::assoc(spec, Role::Write, true)
    }

    /// Validate a stdio spec and resolve it to a concrete binding. All
    /// descriptors are obtained here, before any fork.
    fn assoc(spec: &Stdio, role: Role, is_stderr: bool) -> Result<(ProcStdio, Option<DataReader>)> {
        match spec {
            Stdio::Inherit => Ok((ProcStdio::Inherit, None)),
            Stdio::Fd(fd) => Ok((ProcStdio::Fd(*fd), None)),
            Stdio::Path(path) => {
                let mode = match role {
                    Role::Read => "r",
                    Role::Write => "w",
                };
                let file = File::open(path, mode)?;
                let dev = file.as_dev();
                let child_fd = dev.bind(role)?;
                Ok((ProcStdio::Dev { dev, child_fd }, None))
            }
            Stdio::File(file) => {
                let dev = file.as_dev();
                let child_fd = dev.bind(role)?;
                Ok((ProcStdio::Dev { dev, child_fd }, None))
            }
            Stdio::Reader(reader) => {
                let dev = reader.as_dev();
                let child_fd = dev.bind(role)?;
                let capture = is_stderr.then(|| reader.clone());
                Ok((ProcStdio::Dev { dev, child_fd }, capture))
            }
            Stdio::Writer(writer) => {
                let dev = writer.as_dev();
                let child_fd = dev.bind(role)?;
                Ok((ProcStdio::Dev { dev, child_fd }, None))
            }
            Stdio::Capture => {
                if !is_stderr {
                    return Err(Error::Config(
                        "the capture sentinel is only valid for stderr".into(),
                    ));
                }
                let reader = DataReader::new();
                let dev = reader.as_dev();
                let child_fd = dev.bind(Role::Write)?;
                Ok((ProcStdio::Dev { dev, child_fd }, Some(reader)))
            }
        }
    }

    /// Devices bound to this process's stdio streams.
    pub(crate) fn devices(&self) -> impl Iterator<Item = &Arc<dyn DevOps>> {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .filter_map(|io| match io {
                ProcStdio::Dev { dev, .. } => Some(dev),
                _ => None,
            })
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub(crate) fn pgid(&self) -> Option<Pid> {
        self.pgid
    }

    /// Exit code, or the negated terminating signal, once reaped.
    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// This stage's captured failure, if any, after `poll()` or `wait()`.
    pub fn failure(&self) -> Option<&ProcessError> {
        self.failure.as_ref()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == ProcState::Finished
    }

    /// Fork and exec this process. If `pgid` is `None` the child becomes
    /// the process group leader and this call blocks until the group is
    /// established.
    pub(crate) fn start(&mut self, pgid: Option<Pid>) -> Result<()> {
        if self.state != ProcState::Preinit {
            return Err(Error::Config(format!("process already started: {self}")));
        }
        self.pgid = pgid;
        let mut status = StatusChannel::new()?;
        self.state = ProcState::Startup;
        match unsafe { fork() }? {
            ForkResult::Child => self.child_start(&mut status),
            ForkResult::Parent { child } => {
                self.pid = Some(child);
                status.parent_after_fork();
                self.status = Some(status);
                if self.pgid.is_none() {
                    self.wait_group_leader()?;
                }
                self.state = ProcState::Running;
                Ok(())
            }
        }
    }

    /// Child side of the spawn. Never returns: either the exec replaces
    /// the process image, or the failure is reported over the status
    /// channel and the child exits with a reserved code.
    fn child_start(&mut self, status: &mut StatusChannel) -> ! {
        let err = match self.child_exec(status) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        let _ = status.send(&StatusMsg::Failed(SpawnFailure::from_error(&err)));
        unsafe { nix::libc::_exit(255) }
    }

    fn child_exec(&mut self, status: &mut StatusChannel) -> Result<Infallible> {
        status.child_after_fork();
        self.child_setup_process_group(status)?;
        self.child_stdio_setup()?;
        close_extra_fds(status.write_raw_fd());
        // library code may have disabled SIGPIPE; restore terminate-on-close
        unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }?;
        Ok(execvp(&self.argv[0], &self.argv)?)
    }

    /// The first process becomes group leader and acknowledges over the
    /// status channel; later processes join the existing group before any
    /// user code can run.
    fn child_setup_process_group(&mut self, status: &mut StatusChannel) -> Result<()> {
        match self.pgid {
            None => {
                let pid = unistd::getpid();
                unistd::setpgid(Pid::from_raw(0), pid)?;
                self.pgid = Some(pid);
                status.send(&StatusMsg::GroupReady)?;
            }
            Some(pgid) => unistd::setpgid(Pid::from_raw(0), pgid)?,
        }
        Ok(())
    }

    fn child_stdio_setup(&self) -> Result<()> {
        for (io, stdfd) in [(&self.stdin, 0), (&self.stdout, 1), (&self.stderr, 2)] {
            let fd = match io {
                ProcStdio::Inherit => continue,
                ProcStdio::Fd(fd) => *fd,
                ProcStdio::Dev { child_fd, .. } => *child_fd,
            };
            if fd != stdfd {
                // don't close the source here: stdout and stderr may
                // intentionally alias the same descriptor. Sources are
                // cleaned up by close_extra_fds.
                dup2(fd, stdfd)?;
            }
        }
        Ok(())
    }

    /// Parent side: block until the leader child reports that the process
    /// group exists, or fails, or dies silently.
    fn wait_group_leader(&mut self) -> Result<()> {
        let status = self
            .status
            .as_mut()
            .expect("Should have a status channel after fork");
        match status.recv()? {
            Some(StatusMsg::GroupReady) => {
                self.pgid = self.pid;
                Ok(())
            }
            Some(StatusMsg::Failed(failure)) => {
                let err = ProcessError::spawn(self.to_string(), failure);
                self.failure = Some(err.clone());
                Err(err.into())
            }
            None => Err(Error::Spawn(format!(
                "child process exited without establishing its process group: {self}"
            ))),
        }
    }

    /// Spawn barrier: read the status channel to completion. EOF with no
    /// data means the exec succeeded; anything else is a spawn failure.
    pub(crate) fn exec_wait(&mut self) -> Result<()> {
        let Some(status) = self.status.as_mut() else {
            return Ok(());
        };
        let msg = status.recv()?;
        self.status.take();
        match msg {
            None => Ok(()),
            Some(StatusMsg::Failed(failure)) => {
                let err = ProcessError::spawn(self.to_string(), failure);
                self.failure = Some(err.clone());
                Err(err.into())
            }
            Some(StatusMsg::GroupReady) => Err(Error::Spawn(format!(
                "unexpected message on status channel from: {self}"
            ))),
        }
    }

    /// Record a reaped wait status. Exit 0 and death by SIGPIPE are both
    /// success; any other outcome closes this stage's devices and, unless
    /// the kill was cleanup-induced, captures a failure.
    pub(crate) fn handle_exit(&mut self, wait_status: WaitStatus) {
        let returncode = match wait_status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, sig, _) => -(sig as i32),
            _ => return,
        };
        self.state = ProcState::Finished;
        self.returncode = Some(returncode);
        // close before reading captured stderr, or the race loses the
        // last buffered bytes
        self.close_stdio();
        let sigpipe = -(Signal::SIGPIPE as i32);
        if returncode != 0 && returncode != sigpipe && !self.forced && self.failure.is_none() {
            let stderr = self
                .stderr_capture
                .as_ref()
                .map(|r| r.data())
                .filter(|s| !s.is_empty());
            self.failure = Some(ProcessError::exit(self.to_string(), returncode, stderr));
        }
        self.status.take();
    }

    /// Release only this process's device bindings. A device shared with
    /// a still-running stage keeps its other bindings open.
    fn close_stdio(&self) {
        for io in [&self.stdin, &self.stdout, &self.stderr] {
            if let ProcStdio::Dev { dev, child_fd } = io {
                if let Err(err) = dev.close_binding(*child_fd) {
                    log::warn!("error closing {dev} during exit handling: {err}");
                }
            }
        }
    }

    /// Non-blocking check whether the process has been reaped.
    pub(crate) fn poll(&mut self) -> Result<bool> {
        if self.state == ProcState::Finished {
            return Ok(true);
        }
        let Some(pid) = self.pid else {
            return Ok(false);
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(false),
            wait_status => {
                self.handle_exit(wait_status);
                Ok(true)
            }
        }
    }

    /// Hard-kill during pipeline error cleanup. The `forced` flag keeps
    /// the resulting exit from being recorded as a second failure.
    pub(crate) fn force_finish(&mut self) -> Result<()> {
        if self.state != ProcState::Running && self.state != ProcState::Startup {
            return Ok(());
        }
        // a failed fork leaves Startup with no child to reap
        let Some(pid) = self.pid else {
            self.state = ProcState::Finished;
            return Ok(());
        };
        // the process may have exited on its own already
        if self.poll()? {
            return Ok(());
        }
        self.forced = true;
        nix::sys::signal::kill(pid, Signal::SIGKILL)?;
        let wait_status = waitpid(pid, None)?;
        self.handle_exit(wait_status);
        Ok(())
    }
}

/// Close every open descriptor above the stdio triple, except the status
/// channel's write end. Scans /proc when available, falling back to a
/// walk up to the descriptor limit.
fn close_extra_fds(keep: Option<RawFd>) {
    let keep = keep.unwrap_or(-1);
    match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => {
            // collect first: closing while iterating would pull the
            // directory descriptor out from under the walk
            let mut fds: Vec<RawFd> = Vec::new();
            for entry in entries.flatten() {
                if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                    if fd > 2 && fd != keep {
                        fds.push(fd);
                    }
                }
            }
            for fd in fds {
                let _ = unistd::close(fd);
            }
        }
        Err(_) => {
            let max = unistd::sysconf(SysconfVar::OPEN_MAX)
                .ok()
                .flatten()
                .unwrap_or(256) as RawFd;
            for fd in 3..=max {
                if fd != keep {
                    let _ = unistd::close(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(cmd: &[&str]) -> Process {
        Process::new(
            cmd.iter().map(|s| s.to_string()).collect(),
            StageIo::Spec(&Stdio::Inherit),
            StageIo::Spec(&Stdio::Inherit),
            &Stdio::Inherit,
        )
        .unwrap()
    }

    #[test]
    fn description_is_shell_quoted() {
        let proc = build(&["sh", "-c", "exit 3"]);
        assert_eq!(proc.to_string(), "sh -c 'exit 3'");
    }

    #[test]
    fn empty_command_rejected() {
        let err = Process::new(
            Vec::new(),
            StageIo::Spec(&Stdio::Inherit),
            StageIo::Spec(&Stdio::Inherit),
            &Stdio::Inherit,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn capture_sentinel_rejected_for_stdout() {
        let err = Process::new(
            vec!["true".into()],
            StageIo::Spec(&Stdio::Inherit),
            StageIo::Spec(&Stdio::Capture),
            &Stdio::Inherit,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn capture_sentinel_creates_reader_for_stderr() {
        let proc = build_with_stderr(&Stdio::Capture);
        assert!(proc.stderr_capture.is_some());
    }

    #[test]
    fn force_finish_without_pid_is_safe() {
        // a failed fork leaves Startup with no pid
        let mut proc = build(&["true"]);
        proc.state = ProcState::Startup;
        proc.force_finish().unwrap();
        assert!(proc.is_finished());
        assert!(proc.returncode().is_none());
    }

    #[test]
    fn debug_shows_command_and_state() {
        let proc = build(&["sh", "-c", "exit 3"]);
        let debug = format!("{proc:?}");
        assert!(debug.contains("\"sh\""), "{debug}");
        assert!(debug.contains("Preinit"), "{debug}");
    }

    fn build_with_stderr(stderr: &Stdio) -> Process {
        Process::new(
            vec!["true".into()],
            StageIo::Spec(&Stdio::Inherit),
            StageIo::Spec(&Stdio::Inherit),
            stderr,
        )
        .unwrap()
    }
}
