//! Pipeline construction and supervision. A [`Pipeline`] owns an ordered
//! set of [`Process`] stages joined stdout-to-stdin by anonymous pipes,
//! runs them in a single process group, and reaps them as a unit. The
//! lifecycle is strictly forward: built, running, finished.

use crate::devices::{DevOps, SiblingPipe};
use crate::errors::{Error, ProcessError, Result};
use crate::logging;
use crate::process::{Process, StageIo, Stdio};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Command lists accepted by [`PipelineBuilder::commands`] and the `run`
/// family: anything that iterates into argument vectors.
pub trait IntoCommands {
    fn into_commands(self) -> Vec<Vec<String>>;
}

impl<C, A, S> IntoCommands for C
where
    C: IntoIterator<Item = A>,
    A: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    fn into_commands(self) -> Vec<Vec<String>> {
        self.into_iter()
            .map(|cmd| cmd.into_iter().map(|arg| arg.as_ref().to_string()).collect())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Preinit,
    Running,
    Finished,
}

/// Configures and builds a [`Pipeline`]. Obtained from
/// [`Pipeline::builder`]; methods chain by value.
pub struct PipelineBuilder {
    cmds: Vec<Vec<String>>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    log_target: Option<String>,
    log_level: Option<log::Level>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        PipelineBuilder {
            cmds: Vec::new(),
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            // capture stderr per stage so failures carry their output
            stderr: Stdio::Capture,
            log_target: None,
            log_level: None,
        }
    }
}

impl PipelineBuilder {
    /// Appends one command (program plus arguments) as the next stage.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cmds
            .push(cmd.into_iter().map(|arg| arg.as_ref().to_string()).collect());
        self
    }

    /// Appends a whole list of commands as successive stages.
    pub fn commands(mut self, cmds: impl IntoCommands) -> Self {
        self.cmds.extend(cmds.into_commands());
        self
    }

    /// Stdin for the first stage. Defaults to inheriting the parent's.
    pub fn stdin(mut self, stdin: impl Into<Stdio>) -> Self {
        self.stdin = stdin.into();
        self
    }

    /// Stdout for the last stage. Defaults to inheriting the parent's.
    pub fn stdout(mut self, stdout: impl Into<Stdio>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Stderr for every stage. Defaults to per-stage capture, which
    /// attaches each stage's output to its failure report.
    pub fn stderr(mut self, stderr: impl Into<Stdio>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Log target for this pipeline's lifecycle notifications, overriding
    /// [`logging::set_default_log_target`].
    pub fn log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = Some(target.into());
        self
    }

    /// Severity of this pipeline's lifecycle notifications, overriding
    /// [`logging::set_default_log_level`].
    pub fn log_level(mut self, level: log::Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Builds the pipeline: validates every command, opens every device
    /// descriptor, and wires the inter-stage pipes. Nothing is spawned
    /// until [`Pipeline::start`] or [`Pipeline::wait`].
    pub fn build(self) -> Result<Pipeline> {
        let PipelineBuilder {
            cmds,
            stdin,
            stdout,
            stderr,
            log_target,
            log_level,
        } = self;
        if cmds.is_empty() {
            return Err(Error::Config(
                "pipeline must have at least one command".into(),
            ));
        }
        let last = cmds.len() - 1;
        let mut procs: Vec<Process> = Vec::with_capacity(cmds.len());
        let mut prev: Option<Arc<SiblingPipe>> = None;
        for (i, cmd) in cmds.into_iter().enumerate() {
            let stdin_io = match prev.take() {
                Some(pipe) => StageIo::Pipe(pipe),
                None => StageIo::Spec(&stdin),
            };
            let mut out_pipe = None;
            let stdout_io = if i == last {
                StageIo::Spec(&stdout)
            } else {
                let pipe = Arc::new(SiblingPipe::new()?);
                out_pipe = Some(Arc::clone(&pipe));
                StageIo::Pipe(pipe)
            };
            match Process::new(cmd, stdin_io, stdout_io, &stderr) {
                Ok(proc) => {
                    prev = out_pipe;
                    procs.push(proc);
                }
                Err(err) => {
                    if let Some(pipe) = out_pipe {
                        let _ = pipe.close();
                    }
                    close_devices(procs.iter().flat_map(|p| p.devices()));
                    return Err(err);
                }
            }
        }
        // device set deduplicated by instance: a DataReader shared across
        // stages gets its hooks invoked once
        let mut devs: Vec<Arc<dyn DevOps>> = Vec::new();
        for dev in procs.iter().flat_map(|p| p.devices()) {
            if !devs.iter().any(|d| Arc::ptr_eq(d, dev)) {
                devs.push(Arc::clone(dev));
            }
        }
        Ok(Pipeline {
            stdin_desc: stdin.describe(0),
            stdout_desc: stdout.describe(1),
            stderr_desc: stderr.describe(2),
            procs,
            devs,
            pgid: None,
            by_pid: HashMap::new(),
            state: PipelineState::Preinit,
            log_target: log_target.unwrap_or_else(logging::default_log_target),
            log_level: log_level.unwrap_or_else(logging::default_log_level),
        })
    }
}

fn close_devices<'a>(devs: impl Iterator<Item = &'a Arc<dyn DevOps>>) {
    for dev in devs {
        if let Err(err) = dev.close() {
            log::warn!("error closing {dev} during cleanup: {err}");
        }
    }
}

/// A set of processes connected into a Unix pipeline and supervised as
/// one unit.
///
/// ```no_run
/// # use pipework::{DataReader, DataWriter, Pipeline};
/// # fn example() -> pipework::Result<()> {
/// let out = DataReader::new();
/// Pipeline::builder()
///     .cmd(["cat"])
///     .cmd(["sort", "-r"])
///     .stdin(DataWriter::new("one\ntwo\nthree\n")?)
///     .stdout(&out)
///     .build()?
///     .wait()?;
/// assert_eq!(out.data(), "two\nthree\none\n");
/// # Ok(()) }
/// ```
pub struct Pipeline {
    procs: Vec<Process>,
    devs: Vec<Arc<dyn DevOps>>,
    stdin_desc: Option<String>,
    stdout_desc: Option<String>,
    stderr_desc: Option<String>,
    pgid: Option<Pid>,
    by_pid: HashMap<Pid, usize>,
    state: PipelineState,
    log_target: String,
    log_level: log::Level,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("desc", &self.to_string())
            .field("state", &self.state)
            .field("pgid", &self.pgid)
            .field("procs", &self.procs)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.procs.len() - 1;
        for (i, proc) in self.procs.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{proc}")?;
            if i == 0 {
                if let Some(desc) = &self.stdin_desc {
                    write!(f, " <{desc}")?;
                }
            }
            if i == last {
                if let Some(desc) = &self.stdout_desc {
                    write!(f, " >{desc}")?;
                }
                if let Some(desc) = &self.stderr_desc {
                    write!(f, " 2>{desc}")?;
                }
            }
        }
        Ok(())
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The stages, in pipeline order, for per-stage inspection after
    /// `poll()` or `wait()`.
    pub fn processes(&self) -> &[Process] {
        &self.procs
    }

    /// True once any stage has a recorded failure.
    pub fn failed(&self) -> bool {
        self.procs.iter().any(|p| p.failure().is_some())
    }

    /// The first failure in pipeline order, the one `wait()` reports.
    pub fn failure(&self) -> Option<&ProcessError> {
        self.procs.iter().find_map(|p| p.failure())
    }

    fn log(&self, msg: fmt::Arguments<'_>) {
        log::log!(target: &self.log_target, self.log_level, "{msg}");
    }

    /// Spawns every stage. The first stage becomes the process group
    /// leader; background device threads start only after every child is
    /// past its exec barrier, so a partial spawn can never deadlock on a
    /// full pipe.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Preinit {
            return Err(Error::Config("pipeline already started".into()));
        }
        self.log(format_args!("start: {self}"));
        self.state = PipelineState::Running;
        match self.start_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.log(format_args!("failure: {self}: {err}"));
                self.error_cleanup();
                Err(err)
            }
        }
    }

    fn start_inner(&mut self) -> Result<()> {
        let mut pgid = None;
        for proc in &mut self.procs {
            proc.start(pgid)?;
            if pgid.is_none() {
                pgid = proc.pgid();
            }
        }
        self.pgid = pgid;
        // children hold their own stdio copies now
        for dev in &self.devs {
            dev.post_spawn();
        }
        for proc in &mut self.procs {
            proc.exec_wait()?;
        }
        for dev in &self.devs {
            dev.post_start();
        }
        self.by_pid = self
            .procs
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.pid().map(|pid| (pid, i)))
            .collect();
        Ok(())
    }

    /// Non-blocking progress check, starting the pipeline if necessary.
    /// `Ok(false)` while any stage is still running; on completion,
    /// reports the first failure in pipeline order, or `Ok(true)`.
    pub fn poll(&mut self) -> Result<bool> {
        if self.state == PipelineState::Preinit {
            self.start()?;
        }
        if self.state == PipelineState::Finished {
            return self.finished_result().map(|_| true);
        }
        let mut all = true;
        for proc in &mut self.procs {
            if !proc.poll()? {
                all = false;
            }
        }
        if !all {
            return Ok(false);
        }
        self.conclude().map(|_| true)
    }

    /// Starts the pipeline if necessary, blocks until every stage has
    /// been reaped, and reports the first failure in pipeline order.
    /// Idempotent: calling again on a finished pipeline repeats the
    /// original outcome.
    pub fn wait(&mut self) -> Result<()> {
        if self.state == PipelineState::Preinit {
            self.start()?;
        }
        if self.state == PipelineState::Finished {
            return self.finished_result();
        }
        while self.wait_on_one()? {}
        // a stage reaped by an earlier poll is already recorded; catch
        // anything else the group wait missed
        for proc in &mut self.procs {
            if !proc.is_finished() {
                proc.poll()?;
            }
        }
        self.conclude()
    }

    /// Reap one process from the group. `Ok(false)` once the group is
    /// empty.
    fn wait_on_one(&mut self) -> Result<bool> {
        let Some(pgid) = self.pgid else {
            return Ok(false);
        };
        match waitpid(Pid::from_raw(-pgid.as_raw()), None) {
            Ok(wait_status) => {
                if let Some(pid) = wait_status.pid() {
                    if let Some(&i) = self.by_pid.get(&pid) {
                        self.procs[i].handle_exit(wait_status);
                    }
                }
                Ok(true)
            }
            Err(Errno::ECHILD) => Ok(false),
            Err(Errno::EINTR) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    fn conclude(&mut self) -> Result<()> {
        match self.failure().cloned() {
            Some(err) => {
                self.log(format_args!("failure: {self}: {err}"));
                self.finish_quiet();
                Err(err.into())
            }
            None => {
                self.log(format_args!("success: {self}"));
                self.finish_quiet();
                Ok(())
            }
        }
    }

    fn finished_result(&self) -> Result<()> {
        match self.failure().cloned() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn finish_quiet(&mut self) {
        close_devices(self.devs.iter());
        self.state = PipelineState::Finished;
    }

    /// Signals the whole process group. A no-op unless the pipeline is
    /// running; a group that has already drained is not an error.
    pub fn kill(&mut self, sig: Signal) -> Result<()> {
        if self.state != PipelineState::Running {
            return Ok(());
        }
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        match killpg(pgid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Unconditional teardown: force-terminates any stage still running
    /// and closes every device. Never raises; secondary errors are logged
    /// as warnings. Safe to call at any point, any number of times.
    pub fn shutdown(&mut self) {
        match self.state {
            PipelineState::Running => self.error_cleanup(),
            _ => self.finish_quiet(),
        }
    }

    /// Kill first, then close devices: a capture thread only sees EOF
    /// once every child-side write end is gone, so joining it before the
    /// children die would deadlock.
    fn error_cleanup(&mut self) {
        for proc in &mut self.procs {
            if let Err(err) = proc.force_finish() {
                log::warn!("error forcing termination of {proc}: {err}");
            }
        }
        close_devices(self.devs.iter());
        self.state = PipelineState::Finished;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            self.error_cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DataReader, DataWriter};

    #[test]
    fn description_matches_shell_form() {
        let out = DataReader::new();
        let pipeline = Pipeline::builder()
            .cmd(["cat"])
            .cmd(["sort", "-r"])
            .stdin(DataWriter::new("x\n").unwrap())
            .stdout(&out)
            .build()
            .unwrap();
        assert_eq!(
            pipeline.to_string(),
            "cat <[DataWriter] | sort -r >[DataReader] 2>[DataReader]"
        );
    }

    #[test]
    fn inherited_stdio_omitted_from_description() {
        let pipeline = Pipeline::builder()
            .cmd(["true"])
            .stderr(Stdio::Inherit)
            .build()
            .unwrap();
        assert_eq!(pipeline.to_string(), "true");
    }

    #[test]
    fn empty_pipeline_rejected() {
        let err = Pipeline::builder().build().unwrap_err();
        assert!(err.to_string().contains("at least one command"));
    }

    #[test]
    fn kill_before_start_is_noop() {
        let mut pipeline = Pipeline::builder()
            .cmd(["true"])
            .stderr(Stdio::Inherit)
            .build()
            .unwrap();
        pipeline.kill(Signal::SIGTERM).unwrap();
        pipeline.shutdown();
        pipeline.shutdown();
    }

    #[test]
    fn debug_includes_description_and_state() {
        let pipeline = Pipeline::builder()
            .cmd(["true"])
            .stderr(Stdio::Inherit)
            .build()
            .unwrap();
        let debug = format!("{pipeline:?}");
        assert!(debug.contains("true"), "{debug}");
        assert!(debug.contains("Preinit"), "{debug}");
    }

    #[test]
    fn commands_accepts_nested_lists() {
        let pipeline = Pipeline::builder()
            .commands([["echo", "hi"].as_slice(), ["cat"].as_slice()])
            .stderr(Stdio::Inherit)
            .build()
            .unwrap();
        assert_eq!(pipeline.processes().len(), 2);
    }
}
