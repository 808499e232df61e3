use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::command_id::CommandId;

/// Closed set of failure categories surfaced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The worker connection could not be established or its command
    /// surface could not be loaded.
    TransportUnavailable,
    /// The requested executable could not be found or launched.
    ProcessSpawnFailed,
    /// The external process exited with a non-zero status.
    CommandFailed,
    /// The watchdog fired. The worker is asked to kill the process tree,
    /// but the kill is best-effort: a command may briefly continue running
    /// after the timeout has been reported.
    CommandTimedOut,
    /// The connection dropped while a command was outstanding. Absorbed by
    /// one silent retry; a second occurrence surfaces as
    /// `TransportUnavailable`.
    TransportClosedMidCommand,
    /// No live process is registered for the command id. Used by `kill`
    /// when the command already finished; never escapes `submit()`.
    NoSuchProcess,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::TransportUnavailable => "transport unavailable",
            Self::ProcessSpawnFailed => "process spawn failed",
            Self::CommandFailed => "command failed",
            Self::CommandTimedOut => "command timed out",
            Self::TransportClosedMidCommand => "transport closed mid-command",
            Self::NoSuchProcess => "no such process id",
        };
        write!(f, "{label}")
    }
}

/// Structured command failure carried across the process boundary and
/// returned to callers. Each variant of [`ErrorKind`] carries exactly the
/// fields it needs; no behavior is attached at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
    /// Captured stderr for `CommandFailed`, redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Working directory of the failed spawn, for diagnosability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl CommandError {
    pub fn transport_unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransportUnavailable,
            message: message.into(),
            stderr: None,
            working_directory: None,
        }
    }

    pub fn spawn_failed(message: impl Into<String>, working_directory: &Path) -> Self {
        let directory = working_directory.display().to_string();
        Self {
            kind: ErrorKind::ProcessSpawnFailed,
            message: format!("{} (working directory: {directory})", message.into()),
            stderr: None,
            working_directory: Some(directory),
        }
    }

    pub fn command_failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::CommandFailed,
            message: format!("process exited with status {exit_code}"),
            stderr: Some(stderr.into()),
            working_directory: None,
        }
    }

    pub fn timed_out(seconds: u64) -> Self {
        Self {
            kind: ErrorKind::CommandTimedOut,
            message: format!("no response within {seconds}s"),
            stderr: None,
            working_directory: None,
        }
    }

    pub fn transport_closed() -> Self {
        Self {
            kind: ErrorKind::TransportClosedMidCommand,
            message: "worker connection closed while the command was outstanding".to_string(),
            stderr: None,
            working_directory: None,
        }
    }

    pub fn no_such_process(command_id: CommandId) -> Self {
        Self {
            kind: ErrorKind::NoSuchProcess,
            message: format!("no live process registered for command {command_id}"),
            stderr: None,
            working_directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn spawn_failure_message_names_the_working_directory() {
        let err = CommandError::spawn_failed("no such file", Path::new("/repo/checkout"));
        assert_eq!(err.kind, ErrorKind::ProcessSpawnFailed);
        assert!(err.message.contains("/repo/checkout"));
        assert_eq!(err.working_directory.as_deref(), Some("/repo/checkout"));
    }

    #[test]
    fn command_failure_round_trips_through_json() {
        let err = CommandError::command_failed(128, "fatal: not a git repository");
        let encoded = match serde_json::to_string(&err) {
            Ok(encoded) => encoded,
            Err(err) => panic!("encode failed: {err}"),
        };
        let decoded: CommandError = match serde_json::from_str(&encoded) {
            Ok(decoded) => decoded,
            Err(err) => panic!("decode failed: {err}"),
        };
        assert_eq!(decoded, err);
    }

    #[test]
    fn display_leads_with_the_kind() {
        let err = CommandError::timed_out(30);
        assert_eq!(err.to_string(), "command timed out: no response within 30s");
    }
}
