//! Build, run, and monitor pipelines of child processes connected by
//! pipes. [`Pipeline`] is the heart of this crate: it spawns every stage
//! into one process group, wires stdout to stdin between stages, and
//! reaps the whole group, turning silent non-zero exit codes into real
//! errors. The [`devices`] module supplies the stdio endpoints — files,
//! in-memory feeders and collectors — with the background threads needed
//! to avoid pipe deadlocks. [`Popen`] gives streaming access to one end
//! of a pipeline, and the [`run`]/[`run_out`] family covers the common
//! run-and-wait cases in one call.
//!
//! ```no_run
//! # fn example() -> pipework::Result<()> {
//! let paragraph = pipework::run_out([["fmt", "notes.txt"]])?;
//! # Ok(()) }
//! ```

pub mod devices;
pub mod errors;
/// Process-wide defaults for pipeline lifecycle logging.
pub mod logging;
pub mod pipeline;
pub mod popen;
pub mod process;

// re-exports
pub use devices::{DataReader, DataWriter, File};
pub use errors::{Error, ProcessError, Result};
pub use pipeline::{IntoCommands, Pipeline, PipelineBuilder};
pub use popen::Popen;
pub use process::{Process, Stdio};

/// Signal type accepted by [`Pipeline::kill`], re-exported from `nix`.
pub use nix::sys::signal::Signal;

/// Runs a pipeline to completion with inherited stdio, raising the first
/// failure in pipeline order. Stderr is captured per stage, so a failure
/// carries the stage's output.
pub fn run(cmds: impl IntoCommands) -> Result<()> {
    Pipeline::builder().commands(cmds).build()?.wait()
}

/// Like [`run`], returning the pipeline's captured stdout as text.
pub fn run_out(cmds: impl IntoCommands) -> Result<String> {
    let out = DataReader::new();
    Pipeline::builder()
        .commands(cmds)
        .stdout(&out)
        .build()?
        .wait()?;
    Ok(out.data())
}

/// Like [`run`], with each command given as one shell-quoted string.
pub fn run_lex(cmds: &[&str]) -> Result<()> {
    run(lex(cmds)?)
}

/// Like [`run_out`], with each command given as one shell-quoted string.
pub fn run_lex_out(cmds: &[&str]) -> Result<String> {
    run_out(lex(cmds)?)
}

fn lex(cmds: &[&str]) -> Result<Vec<Vec<String>>> {
    cmds.iter()
        .map(|line| {
            shlex::split(line)
                .ok_or_else(|| Error::Config(format!("cannot split command: {line:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lex_splits_quoted_arguments() {
        let cmds = lex(&["grep -F 'a b'", "wc -l"]).unwrap();
        assert_eq!(cmds, vec![vec!["grep", "-F", "a b"], vec!["wc", "-l"]]);
    }

    #[test]
    fn lex_rejects_unbalanced_quotes() {
        assert!(lex(&["grep 'unterminated"]).is_err());
    }
}
