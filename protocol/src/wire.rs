use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

use crate::command_id::CommandId;
use crate::error::CommandError;
use crate::progress::ProgressEvent;

/// One request line sent from the front end to the worker.
///
/// `request_id` is a transport-level correlation id, distinct from
/// [`CommandId`]: every operation gets one, including probes that are not
/// commands (`which`, `path_exists`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub request_id: u64,
    pub op: WorkerOp,
}

/// The worker's RPC command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerOp {
    /// Handshake; the response advertises the command surface.
    Hello,
    /// Run to completion with buffered output.
    Execute {
        directory: PathBuf,
        command: String,
        args: Vec<String>,
        command_id: CommandId,
    },
    /// Run with incrementally consumed output; stderr lines are forwarded
    /// as progress events when `watch_progress` is set.
    Spawn {
        directory: PathBuf,
        command: String,
        args: Vec<String>,
        command_id: CommandId,
        watch_progress: bool,
    },
    /// Terminate the command's process together with its descendant tree.
    Kill { command_id: CommandId },
    /// Resolve an executable to its real absolute path.
    Which { file_path: String },
    /// Probe whether a path exists.
    PathExists { path: PathBuf },
}

/// One line sent from the worker to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireOutbound {
    Response {
        request_id: u64,
        payload: ResponsePayload,
    },
    Progress {
        event: ProgressEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponsePayload {
    Ok { response: WorkerResponse },
    Err { error: CommandError },
}

impl ResponsePayload {
    pub fn ok(response: WorkerResponse) -> Self {
        Self::Ok { response }
    }

    pub fn err(error: CommandError) -> Self {
        Self::Err { error }
    }

    pub fn into_result(self) -> Result<WorkerResponse, CommandError> {
        match self {
            Self::Ok { response } => Ok(response),
            Self::Err { error } => Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Hello { commands: Vec<String> },
    Execute { output: ProcessOutput },
    Spawn { output: ProcessOutput },
    Kill { killed: bool },
    Which { path: PathBuf },
    PathExists { exists: bool },
}

/// Buffered output of a finished process. stdout and stderr are tracked as
/// two independent ordered buffers, not interleaved byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip_request(request: &WireRequest) -> WireRequest {
        let encoded = match serde_json::to_string(request) {
            Ok(encoded) => encoded,
            Err(err) => panic!("encode failed: {err}"),
        };
        match serde_json::from_str(&encoded) {
            Ok(decoded) => decoded,
            Err(err) => panic!("decode failed: {err}"),
        }
    }

    #[test]
    fn spawn_request_round_trips() {
        let request = WireRequest {
            request_id: 7,
            op: WorkerOp::Spawn {
                directory: PathBuf::from("/repo"),
                command: "git".to_string(),
                args: vec!["fetch".to_string(), "--progress".to_string()],
                command_id: CommandId::new(41),
                watch_progress: true,
            },
        };
        assert_eq!(round_trip_request(&request), request);
    }

    #[test]
    fn error_payload_round_trips() {
        let outbound = WireOutbound::Response {
            request_id: 3,
            payload: ResponsePayload::err(CommandError::no_such_process(CommandId::new(9))),
        };
        let encoded = match serde_json::to_string(&outbound) {
            Ok(encoded) => encoded,
            Err(err) => panic!("encode failed: {err}"),
        };
        let decoded: WireOutbound = match serde_json::from_str(&encoded) {
            Ok(decoded) => decoded,
            Err(err) => panic!("decode failed: {err}"),
        };
        assert_eq!(decoded, outbound);
    }

    #[test]
    fn progress_event_is_tagged() {
        let outbound = WireOutbound::Progress {
            event: ProgressEvent {
                command_id: CommandId::new(5),
                timestamp_millis: 1_700_000_000_000,
                message: "Receiving objects: 10%".to_string(),
            },
        };
        let encoded = match serde_json::to_string(&outbound) {
            Ok(encoded) => encoded,
            Err(err) => panic!("encode failed: {err}"),
        };
        assert!(encoded.contains(r#""type":"progress""#));
    }
}
