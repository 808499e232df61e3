use std::fmt;
use std::path::PathBuf;

use crate::watchdog::TimeoutPredicate;

/// How long the watchdog waits before killing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never time out, regardless of elapsed time.
    Never,
    Seconds(u64),
}

impl Timeout {
    pub(crate) fn seconds(&self) -> Option<u64> {
        match self {
            Self::Never => None,
            Self::Seconds(seconds) => Some(*seconds),
        }
    }
}

/// Execution mode requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Buffered: collect all output, resolve at exit.
    Execute,
    /// Streaming: consume output incrementally, with progress events.
    Spawn,
}

#[derive(Clone, Default)]
pub struct CommandOptions {
    /// Overrides the pipeline's default timeout when set.
    pub timeout: Option<Timeout>,
    /// Dispatch immediately instead of waiting for a turn in the blocking
    /// FIFO.
    pub nonblocking: bool,
    /// Suppress timeout error logging; for commands whose desired effect is
    /// to stay alive past the timeout, such as opening an interactive
    /// terminal.
    pub timeout_expected: bool,
    /// Liveness probe evaluated once per timeout interval in place of the
    /// fixed or progress-driven timer.
    pub timeout_predicate: Option<TimeoutPredicate>,
    /// Forces the execution mode; derived from the args when unset.
    pub mode: Option<ExecMode>,
}

impl fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOptions")
            .field("timeout", &self.timeout)
            .field("nonblocking", &self.nonblocking)
            .field("timeout_expected", &self.timeout_expected)
            .field("timeout_predicate", &self.timeout_predicate.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

/// A caller's request to run an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Defaults to the pipeline's configured executable when `None`.
    pub executable: Option<String>,
    pub args: Vec<String>,
    /// Defaults to the project root when `None`.
    pub working_directory: Option<PathBuf>,
    pub options: CommandOptions,
}

impl CommandSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// `--progress` in the args signals incremental output on stderr, e.g. for
/// fetch/push/clone.
pub(crate) fn watches_progress(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "--progress")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_flag_is_detected() {
        let spec = CommandSpec::new(["fetch", "--progress", "origin"]);
        assert!(watches_progress(&spec.args));
        let plain = CommandSpec::new(["status", "--porcelain"]);
        assert!(!watches_progress(&plain.args));
    }

    #[test]
    fn never_timeout_has_no_budget() {
        assert_eq!(Timeout::Seconds(3).seconds(), Some(3));
        assert_eq!(Timeout::Never.seconds(), None);
    }
}
