//! Process-wide defaults for pipeline lifecycle logging. Each pipeline
//! snapshots the target and severity at construction, so changing the
//! defaults never affects a pipeline that already exists. Per-pipeline
//! overrides go through [`PipelineBuilder::log_target`] and
//! [`PipelineBuilder::log_level`].
//!
//! [`PipelineBuilder::log_target`]: crate::PipelineBuilder::log_target
//! [`PipelineBuilder::log_level`]: crate::PipelineBuilder::log_level

use log::Level;
use std::sync::RwLock;

const CRATE_TARGET: &str = "pipework";

struct Defaults {
    target: Option<String>,
    level: Level,
}

static DEFAULTS: RwLock<Defaults> = RwLock::new(Defaults {
    target: None,
    level: Level::Debug,
});

fn read() -> std::sync::RwLockReadGuard<'static, Defaults> {
    DEFAULTS.read().unwrap_or_else(|e| e.into_inner())
}

fn write() -> std::sync::RwLockWriteGuard<'static, Defaults> {
    DEFAULTS.write().unwrap_or_else(|e| e.into_inner())
}

/// Sets the default log target for pipelines constructed from now on.
pub fn set_default_log_target(target: impl Into<String>) {
    write().target = Some(target.into());
}

/// Reverts to the crate-name target.
pub fn clear_default_log_target() {
    write().target = None;
}

pub fn default_log_target() -> String {
    read()
        .target
        .clone()
        .unwrap_or_else(|| CRATE_TARGET.to_string())
}

/// Sets the default severity of pipeline lifecycle notifications for
/// pipelines constructed from now on. Debug when never set.
pub fn set_default_log_level(level: Level) {
    write().level = level;
}

pub fn default_log_level() -> Level {
    read().level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_defaults_to_crate_name() {
        // no set/clear here: other tests run in parallel against the
        // same process-wide state
        assert!(!default_log_target().is_empty());
    }
}
