//! Wire types shared by the capstan front end and the worker process.
//!
//! Everything that crosses the process boundary lives here: command ids,
//! the request/response/progress envelopes, the error taxonomy, and the
//! redaction applied to text before it leaves the pipeline.

mod command_id;
mod error;
mod progress;
pub mod redact;
mod wire;

pub use command_id::CommandId;
pub use error::CommandError;
pub use error::ErrorKind;
pub use progress::ProgressEvent;
pub use wire::ProcessOutput;
pub use wire::ResponsePayload;
pub use wire::WireOutbound;
pub use wire::WireRequest;
pub use wire::WorkerOp;
pub use wire::WorkerResponse;
