//! Front-end half of capstan: accepts command requests, serializes them
//! into a blocking FIFO (or dispatches immediately when marked
//! non-blocking), supervises every in-flight command with a watchdog, and
//! forwards the work to the sandboxed worker process over the transport.
//!
//! The only two entry points the rest of an application consumes are
//! [`Pipeline::submit`] and [`Pipeline::subscribe_progress`].

mod command;
mod dispatch;
mod transport;
mod watchdog;

pub use command::CommandOptions;
pub use command::CommandSpec;
pub use command::ExecMode;
pub use command::Timeout;
pub use transport::CommandTransport;
pub use transport::ConnectFailure;
pub use transport::TransportError;
pub use transport::WorkerReply;
pub use transport::WorkerTransport;
pub use watchdog::TimeoutPredicate;

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use capstan_protocol::CommandError;
use capstan_protocol::ProgressEvent;

use crate::dispatch::PipelineInner;

/// Supplies the default working directory for commands that omit one.
pub trait ProjectRootProvider: Send + Sync {
    fn project_root(&self) -> PathBuf;
}

/// Provider returning a fixed directory.
pub struct FixedProjectRoot(pub PathBuf);

impl ProjectRootProvider for FixedProjectRoot {
    fn project_root(&self) -> PathBuf {
        self.0.clone()
    }
}

/// Pipeline settings, typically loaded from the host application's
/// preferences store.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// External executable run when a request names none.
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Path to the worker binary the transport spawns.
    #[serde(default = "default_worker_path")]
    pub worker_path: PathBuf,
    /// Watchdog budget applied when a request does not override it.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_executable() -> String {
    "git".to_string()
}

fn default_worker_path() -> PathBuf {
    PathBuf::from("capstan-worker")
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            worker_path: default_worker_path(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

/// The front end's command pipeline: one queue, one connection, one
/// in-flight table. Constructed once per process lifetime and passed by
/// reference to callers; there is no module-level state.
pub struct Pipeline {
    inner: Arc<PipelineInner>,
    dispatch_task: JoinHandle<()>,
    progress_task: JoinHandle<()>,
}

impl Pipeline {
    /// Build a pipeline that spawns and talks to the worker binary named by
    /// `config`.
    pub fn new(config: PipelineConfig, roots: Arc<dyn ProjectRootProvider>) -> Self {
        let transport = Arc::new(WorkerTransport::new(config.worker_path.clone()));
        Self::with_transport(config, roots, transport)
    }

    /// Build a pipeline over a caller-supplied transport.
    pub fn with_transport(
        config: PipelineConfig,
        roots: Arc<dyn ProjectRootProvider>,
        transport: Arc<dyn CommandTransport>,
    ) -> Self {
        let (inner, queue_rx) = PipelineInner::new(config, roots, transport);
        let dispatch_task = tokio::spawn(Arc::clone(&inner).dispatch_loop(queue_rx));
        let progress_task = tokio::spawn(Arc::clone(&inner).progress_loop());
        Self {
            inner,
            dispatch_task,
            progress_task,
        }
    }

    /// Submit a command and await its terminal result: the command's stdout
    /// on success, a structured [`CommandError`] otherwise. Never fails
    /// synchronously; every failure path, including "the worker connection
    /// could not be established", arrives as an error result.
    pub async fn submit(&self, spec: CommandSpec) -> Result<String, CommandError> {
        self.inner.submit(spec).await
    }

    /// Subscribe to the live progress event stream.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.transport.subscribe_progress()
    }

    /// Stop the worker process. In-flight commands resolve with transport
    /// errors.
    pub async fn shutdown(&self) {
        self.inner.transport.shutdown().await;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        self.progress_task.abort();
    }
}
