use std::io;
use std::path::PathBuf;
use thiserror::Error;

use capstan_protocol::CommandError;
use capstan_protocol::CommandId;
use capstan_protocol::ErrorKind;
use capstan_protocol::redact::redact;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        working_directory: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no live process registered for command {command_id}")]
    NoSuchProcessId { command_id: CommandId },
    #[error("failed to read process output: {0}")]
    ReadOutput(#[source] io::Error),
    #[error("failed to wait for process exit: {0}")]
    Wait(#[source] io::Error),
    #[error("could not resolve `{file_path}`: {source}")]
    Which {
        file_path: String,
        #[source]
        source: which::Error,
    },
    #[error("process tree termination failed: {message}")]
    Kill { message: String },
}

impl WorkerError {
    /// Convert into the wire-level taxonomy, redacting every text field
    /// before it crosses the process boundary.
    pub fn to_command_error(&self) -> CommandError {
        match self {
            Self::Spawn {
                command,
                working_directory,
                source,
            } => {
                let mut err = CommandError::spawn_failed(
                    format!("failed to launch `{command}`: {source}"),
                    working_directory,
                );
                err.message = redact(&err.message);
                err.working_directory = err.working_directory.as_deref().map(redact);
                err
            }
            Self::NoSuchProcessId { command_id } => CommandError::no_such_process(*command_id),
            Self::Which { .. } => CommandError {
                kind: ErrorKind::ProcessSpawnFailed,
                message: redact(&self.to_string()),
                stderr: None,
                working_directory: None,
            },
            Self::ReadOutput(_) | Self::Wait(_) | Self::Kill { .. } => CommandError {
                kind: ErrorKind::CommandFailed,
                message: redact(&self.to_string()),
                stderr: None,
                working_directory: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    #[test]
    fn spawn_failure_becomes_process_spawn_failed() {
        let err = WorkerError::Spawn {
            command: "git".to_string(),
            working_directory: PathBuf::from("/tmp/checkout"),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };
        let converted = err.to_command_error();
        assert_eq!(converted.kind, ErrorKind::ProcessSpawnFailed);
        assert!(converted.message.contains("/tmp/checkout"));
    }

    #[test]
    fn missing_process_id_is_not_fatal_shaped() {
        let err = WorkerError::NoSuchProcessId {
            command_id: CommandId::new(12),
        };
        let converted = err.to_command_error();
        assert_eq!(converted.kind, ErrorKind::NoSuchProcess);
        assert!(converted.message.contains("#12"));
    }

    #[test]
    fn spawn_failure_message_is_redacted() {
        let err = WorkerError::Spawn {
            command: "git".to_string(),
            working_directory: Path::new("/home/alice/repo").to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let converted = err.to_command_error();
        assert!(!converted.message.contains("alice"), "{}", converted.message);
    }
}
