use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Identifier the front end assigns to each command request.
///
/// Ids are allocated from a monotonically increasing counter that wraps at
/// `u32::MAX`; the dispatcher guarantees an id is never reused while the
/// prior holder is still live. The two sides of the process boundary
/// correlate state solely through this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u32);

impl CommandId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
