use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use capstan_protocol::CommandError;
use capstan_protocol::CommandId;
use capstan_protocol::ErrorKind;
use capstan_protocol::WorkerOp;
use capstan_protocol::WorkerResponse;
use capstan_protocol::redact::redact;

use crate::PipelineConfig;
use crate::ProjectRootProvider;
use crate::command::CommandSpec;
use crate::command::ExecMode;
use crate::command::Timeout;
use crate::command::watches_progress;
use crate::transport::CommandTransport;
use crate::transport::TransportError;
use crate::transport::WorkerReply;
use crate::watchdog;
use crate::watchdog::TimeoutPolicy;
use crate::watchdog::TimeoutPredicate;

/// Front-end record of a command between dispatch and resolution. Progress
/// events reset `last_progress`, which is what the progress-driven watchdog
/// measures against.
pub(crate) struct InFlight {
    pub(crate) last_progress: Mutex<Instant>,
}

pub(crate) struct QueuedCommand {
    request: PreparedCommand,
    reply_tx: oneshot::Sender<Result<String, CommandError>>,
}

struct PreparedCommand {
    id: CommandId,
    executable: String,
    args: Vec<String>,
    working_directory: PathBuf,
    mode: ExecMode,
    timeout: Timeout,
    watch_progress: bool,
    timeout_expected: bool,
    nonblocking: bool,
    predicate: Option<TimeoutPredicate>,
}

impl PreparedCommand {
    fn to_op(&self, executable: String) -> WorkerOp {
        match self.mode {
            ExecMode::Execute => WorkerOp::Execute {
                directory: self.working_directory.clone(),
                command: executable,
                args: self.args.clone(),
                command_id: self.id,
            },
            ExecMode::Spawn => WorkerOp::Spawn {
                directory: self.working_directory.clone(),
                command: executable,
                args: self.args.clone(),
                command_id: self.id,
                watch_progress: self.watch_progress,
            },
        }
    }

    fn policy(&self) -> TimeoutPolicy {
        match self.timeout {
            Timeout::Never => TimeoutPolicy::Never,
            Timeout::Seconds(seconds) => {
                let budget = Duration::from_secs(seconds);
                if let Some(predicate) = &self.predicate {
                    TimeoutPolicy::Predicate {
                        tick: budget,
                        predicate: Arc::clone(predicate),
                    }
                } else if self.watch_progress {
                    TimeoutPolicy::ProgressDriven(budget)
                } else {
                    TimeoutPolicy::Fixed(budget)
                }
            }
        }
    }
}

/// State shared by the pipeline handle and its background tasks: the
/// blocking FIFO, the in-flight table, and the transport.
pub(crate) struct PipelineInner {
    pub(crate) config: PipelineConfig,
    pub(crate) roots: Arc<dyn ProjectRootProvider>,
    pub(crate) transport: Arc<dyn CommandTransport>,
    queue_tx: mpsc::UnboundedSender<QueuedCommand>,
    live: Mutex<HashMap<CommandId, Arc<InFlight>>>,
    resolved_executables: Mutex<HashMap<String, String>>,
    next_command_id: AtomicU32,
}

impl PipelineInner {
    pub(crate) fn new(
        config: PipelineConfig,
        roots: Arc<dyn ProjectRootProvider>,
        transport: Arc<dyn CommandTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueuedCommand>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Self {
            config,
            roots,
            transport,
            queue_tx,
            live: Mutex::new(HashMap::new()),
            resolved_executables: Mutex::new(HashMap::new()),
            next_command_id: AtomicU32::new(1),
        });
        (inner, queue_rx)
    }

    /// Blocking commands run strictly one at a time, in FIFO order; the
    /// queue itself is the backpressure mechanism.
    pub(crate) async fn dispatch_loop(
        self: Arc<Self>,
        mut queue_rx: mpsc::UnboundedReceiver<QueuedCommand>,
    ) {
        while let Some(entry) = queue_rx.recv().await {
            self.run_command(entry).await;
        }
    }

    /// Routes progress events into the in-flight table so the
    /// progress-driven watchdog sees them.
    pub(crate) async fn progress_loop(self: Arc<Self>) {
        let mut events = self.transport.subscribe_progress();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let entry = { self.live.lock().await.get(&event.command_id).cloned() };
                    if let Some(entry) = entry {
                        *entry.last_progress.lock().await = Instant::now();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub(crate) async fn submit(
        self: &Arc<Self>,
        spec: CommandSpec,
    ) -> Result<String, CommandError> {
        let request = self.prepare(spec).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        let entry = QueuedCommand { request, reply_tx };
        if entry.request.nonblocking {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run_command(entry).await;
            });
        } else if self.queue_tx.send(entry).is_err() {
            return Err(CommandError::transport_unavailable(
                "command dispatcher is not running",
            ));
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::transport_unavailable(
                "command dispatcher stopped before the command resolved",
            )),
        }
    }

    async fn prepare(&self, spec: CommandSpec) -> PreparedCommand {
        let CommandSpec {
            executable,
            args,
            working_directory,
            options,
        } = spec;
        let id = self.allocate_id().await;
        let watch_progress = watches_progress(&args);
        let mode = options.mode.unwrap_or(if watch_progress {
            ExecMode::Spawn
        } else {
            ExecMode::Execute
        });
        PreparedCommand {
            id,
            executable: executable.unwrap_or_else(|| self.config.executable.clone()),
            args,
            working_directory: working_directory.unwrap_or_else(|| self.roots.project_root()),
            mode,
            timeout: options
                .timeout
                .unwrap_or(Timeout::Seconds(self.config.default_timeout_secs)),
            watch_progress,
            timeout_expected: options.timeout_expected,
            nonblocking: options.nonblocking,
            predicate: options.timeout_predicate,
        }
    }

    /// Next id from the wrapping counter, skipping any id still held by a
    /// live command.
    async fn allocate_id(&self) -> CommandId {
        let live = self.live.lock().await;
        loop {
            let id = CommandId::new(self.next_command_id.fetch_add(1, Ordering::Relaxed));
            if !live.contains_key(&id) {
                return id;
            }
        }
    }

    async fn run_command(self: &Arc<Self>, entry: QueuedCommand) {
        let QueuedCommand { request, reply_tx } = entry;
        let first = self.attempt(&request).await;
        let result = match first {
            // A transport-level close is absorbed by one silent retry of
            // the same request; a second occurrence surfaces as
            // `TransportUnavailable`.
            Err(err) if err.kind == ErrorKind::TransportClosedMidCommand => {
                warn!(id = %request.id, "worker connection dropped mid-command; retrying once");
                match self.attempt(&request).await {
                    Err(retry_err) if retry_err.kind == ErrorKind::TransportClosedMidCommand => {
                        Err(CommandError::transport_unavailable(
                            "worker connection lost twice while running the command",
                        ))
                    }
                    other => other,
                }
            }
            other => other,
        };
        self.live.lock().await.remove(&request.id);
        let _ = reply_tx.send(result);
    }

    async fn attempt(&self, request: &PreparedCommand) -> Result<String, CommandError> {
        if let Err(err) = self.transport.ensure_connected().await {
            return Err(CommandError::transport_unavailable(err.to_string()));
        }
        let executable = self.resolve_executable(&request.executable).await;
        let in_flight = Arc::new(InFlight {
            last_progress: Mutex::new(Instant::now()),
        });
        self.live
            .lock()
            .await
            .insert(request.id, Arc::clone(&in_flight));
        let policy = request.policy();
        let op = request.to_op(executable);
        tokio::select! {
            reply = self.transport.request(op) => convert_reply(reply),
            () = watchdog::wait_for_timeout(&policy, &in_flight) => {
                self.kill_after_timeout(request);
                Err(CommandError::timed_out(request.timeout.seconds().unwrap_or(0)))
            }
        }
    }

    /// Resolve the executable's real path through the worker once; repeated
    /// commands against the same executable skip resolution.
    async fn resolve_executable(&self, executable: &str) -> String {
        if let Some(resolved) = self.resolved_executables.lock().await.get(executable) {
            return resolved.clone();
        }
        let resolved = match self
            .transport
            .request(WorkerOp::Which {
                file_path: executable.to_string(),
            })
            .await
        {
            Ok(Ok(WorkerResponse::Which { path })) => path.display().to_string(),
            Ok(Err(err)) => {
                debug!(executable, error = %err, "executable resolution failed; using the name as given");
                return executable.to_string();
            }
            Ok(Ok(_)) | Err(_) => return executable.to_string(),
        };
        self.resolved_executables
            .lock()
            .await
            .insert(executable.to_string(), resolved.clone());
        resolved
    }

    /// The timeout result is reported without waiting for the kill to be
    /// confirmed, so a command may briefly keep running in the background
    /// after the caller has seen the timeout.
    fn kill_after_timeout(&self, request: &PreparedCommand) {
        if request.timeout_expected {
            debug!(id = %request.id, "expected timeout reached; killing the worker-side process");
        } else {
            warn!(
                id = %request.id,
                executable = %request.executable,
                "command timed out; killing its process tree"
            );
        }
        let transport = Arc::clone(&self.transport);
        let command_id = request.id;
        tokio::spawn(async move {
            match transport.request(WorkerOp::Kill { command_id }).await {
                Ok(Ok(WorkerResponse::Kill { killed })) => {
                    debug!(%command_id, killed, "kill completed");
                }
                Ok(Ok(_)) => debug!(%command_id, "unexpected kill response"),
                Ok(Err(err)) => debug!(%command_id, error = %err, "kill refused"),
                Err(err) => debug!(%command_id, error = %err, "kill request failed"),
            }
        });
    }
}

fn convert_reply(reply: Result<WorkerReply, TransportError>) -> Result<String, CommandError> {
    match reply {
        Ok(Ok(WorkerResponse::Execute { output } | WorkerResponse::Spawn { output })) => {
            if output.exit_code == 0 {
                Ok(redact(&output.stdout))
            } else {
                Err(CommandError::command_failed(
                    output.exit_code,
                    redact(&output.stderr),
                ))
            }
        }
        Ok(Ok(other)) => Err(CommandError::transport_unavailable(format!(
            "unexpected worker response: {other:?}"
        ))),
        Ok(Err(error)) => Err(error),
        Err(TransportError::ClosedMidCommand | TransportError::NotConnected) => {
            Err(CommandError::transport_closed())
        }
        Err(err) => Err(CommandError::transport_unavailable(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedProjectRoot;
    use async_trait::async_trait;
    use capstan_protocol::ProgressEvent;

    struct NullTransport {
        progress_tx: broadcast::Sender<ProgressEvent>,
    }

    impl NullTransport {
        fn new() -> Arc<Self> {
            let (progress_tx, _) = broadcast::channel(8);
            Arc::new(Self { progress_tx })
        }
    }

    #[async_trait]
    impl CommandTransport for NullTransport {
        async fn ensure_connected(&self) -> Result<bool, TransportError> {
            Ok(true)
        }

        async fn request(&self, _op: WorkerOp) -> Result<WorkerReply, TransportError> {
            Err(TransportError::NotConnected)
        }

        fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
            self.progress_tx.subscribe()
        }

        async fn shutdown(&self) {}
    }

    fn inner_with_null_transport() -> Arc<PipelineInner> {
        let (inner, _queue_rx) = PipelineInner::new(
            PipelineConfig::default(),
            Arc::new(FixedProjectRoot(PathBuf::from("/tmp"))),
            NullTransport::new(),
        );
        inner
    }

    #[tokio::test]
    async fn id_allocation_wraps_and_skips_live_ids() {
        let inner = inner_with_null_transport();
        inner.next_command_id.store(u32::MAX, Ordering::Relaxed);
        inner.live.lock().await.insert(
            CommandId::new(0),
            Arc::new(InFlight {
                last_progress: Mutex::new(Instant::now()),
            }),
        );

        assert_eq!(inner.allocate_id().await, CommandId::new(u32::MAX));
        // The counter wraps to 0, which is still live, so it is skipped.
        assert_eq!(inner.allocate_id().await, CommandId::new(1));
    }

    #[tokio::test]
    async fn progress_flag_selects_spawn_mode() {
        let inner = inner_with_null_transport();
        let prepared = inner
            .prepare(CommandSpec::new(["fetch", "--progress", "origin"]))
            .await;
        assert_eq!(prepared.mode, ExecMode::Spawn);
        assert!(prepared.watch_progress);

        let plain = inner.prepare(CommandSpec::new(["status"])).await;
        assert_eq!(plain.mode, ExecMode::Execute);
        assert!(!plain.watch_progress);
    }

    #[tokio::test]
    async fn defaults_come_from_config_and_root_provider() {
        let inner = inner_with_null_transport();
        let prepared = inner.prepare(CommandSpec::new(["status"])).await;
        assert_eq!(prepared.executable, "git");
        assert_eq!(prepared.working_directory, PathBuf::from("/tmp"));
        assert_eq!(prepared.timeout, Timeout::Seconds(30));
    }
}
