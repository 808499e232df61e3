use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::command_id::CommandId;

/// Unsolicited progress message tied to a command id.
///
/// Zero or many events may arrive per command, always before the command's
/// terminal response. Consumers use them for live output display; the
/// watchdog uses them to reset its progress-driven timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub command_id: CommandId,
    pub timestamp_millis: i64,
    pub message: String,
}

impl ProgressEvent {
    /// Build an event stamped with the current wall-clock time.
    pub fn now(command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            command_id,
            timestamp_millis: Utc::now().timestamp_millis(),
            message: message.into(),
        }
    }
}
