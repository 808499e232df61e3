use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use capstan_protocol::CommandError;
use capstan_protocol::ProgressEvent;
use capstan_protocol::WireOutbound;
use capstan_protocol::WireRequest;
use capstan_protocol::WorkerOp;
use capstan_protocol::WorkerResponse;

/// Command-level outcome of one request: the worker replied, either with a
/// response or with a structured command failure. Transport-level failures
/// live in [`TransportError`] instead.
pub type WorkerReply = Result<WorkerResponse, CommandError>;

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error)]
pub enum ConnectFailure {
    #[error("maximum connection attempts reached")]
    MaxAttempts,
    #[error("failed to launch worker `{path}`: {message}")]
    Launch { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("worker transport is not connected")]
    NotConnected,
    #[error(transparent)]
    Connect(#[from] ConnectFailure),
    #[error("worker connection closed while a request was outstanding")]
    ClosedMidCommand,
}

/// The front end's view of the worker connection.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Connect if necessary. Returns whether a connection already existed.
    async fn ensure_connected(&self) -> Result<bool, TransportError>;

    /// Send one request and await its response.
    async fn request(&self, op: WorkerOp) -> Result<WorkerReply, TransportError>;

    /// Subscribe to the worker's progress event stream. The stream survives
    /// reconnects.
    fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent>;

    /// Tear down the connection, killing the worker process.
    async fn shutdown(&self);
}

type ConnectResult = Result<(), ConnectFailure>;
type SharedConnect = Shared<BoxFuture<'static, ConnectResult>>;
type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerReply>>>>;

/// Transport speaking newline-delimited JSON to a spawned worker process
/// over its stdin/stdout. Connects lazily, re-establishes after a lost
/// connection, and shares one in-flight connection attempt among concurrent
/// callers.
pub struct WorkerTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    worker_path: PathBuf,
    conn: Mutex<Option<Arc<Connection>>>,
    connecting: Mutex<Option<SharedConnect>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
}

struct Connection {
    generation: u64,
    outbound_tx: mpsc::UnboundedSender<WireRequest>,
    pending: PendingReplies,
    /// Set by the reader task before it drains the pending map, so no new
    /// request can be parked on a connection that is already gone.
    closed: Arc<AtomicBool>,
    /// Command surface advertised by the worker's hello response; loaded
    /// once per connection.
    commands: Vec<String>,
    child: Mutex<Child>,
}

enum TryConnectError {
    /// Retrying cannot help (e.g. the worker binary does not exist).
    Fatal(ConnectFailure),
    Handshake(String),
}

impl WorkerTransport {
    pub fn new(worker_path: PathBuf) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TransportInner {
                worker_path,
                conn: Mutex::new(None),
                connecting: Mutex::new(None),
                progress_tx,
                next_request_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }
}

#[async_trait]
impl CommandTransport for WorkerTransport {
    async fn ensure_connected(&self) -> Result<bool, TransportError> {
        {
            let mut guard = self.inner.conn.lock().await;
            match guard.as_ref() {
                Some(conn) if !conn.closed.load(Ordering::SeqCst) => return Ok(true),
                // A dead connection the reader has not yet torn down.
                Some(_) => *guard = None,
                None => {}
            }
        }
        match TransportInner::join_connect(&self.inner).await {
            Ok(()) => Ok(false),
            Err(ConnectFailure::MaxAttempts) => {
                // One automatic retry of the whole connect before the
                // failure reaches a caller.
                warn!("worker connection attempts exhausted; retrying once");
                match TransportInner::join_connect(&self.inner).await {
                    Ok(()) => Ok(false),
                    Err(failure) => Err(failure.into()),
                }
            }
            Err(failure) => Err(failure.into()),
        }
    }

    async fn request(&self, op: WorkerOp) -> Result<WorkerReply, TransportError> {
        let conn = { self.inner.conn.lock().await.clone() };
        let Some(conn) = conn else {
            return Err(TransportError::NotConnected);
        };
        if conn.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ClosedMidCommand);
        }
        send_request(
            &self.inner.next_request_id,
            &conn.pending,
            &conn.outbound_tx,
            &conn.closed,
            op,
        )
        .await
        .map_err(|_| TransportError::ClosedMidCommand)
    }

    fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress_tx.subscribe()
    }

    async fn shutdown(&self) {
        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            let mut child = conn.child.lock().await;
            if let Err(err) = child.start_kill() {
                debug!(error = %err, "worker already exited");
            }
        }
    }
}

impl TransportInner {
    /// Join (or start) the one connection attempt allowed to be in flight.
    /// The memoized attempt is cleared once it settles, success or failure.
    async fn join_connect(inner: &Arc<Self>) -> ConnectResult {
        let (connect, created) = {
            let mut guard = inner.connecting.lock().await;
            match guard.as_ref() {
                Some(connect) => (connect.clone(), false),
                None => {
                    let connect = Self::establish(Arc::clone(inner)).boxed().shared();
                    *guard = Some(connect.clone());
                    (connect, true)
                }
            }
        };
        let result = connect.await;
        if created {
            *inner.connecting.lock().await = None;
        }
        result
    }

    async fn establish(inner: Arc<Self>) -> ConnectResult {
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match Self::try_connect(&inner).await {
                Ok(connection) => {
                    debug!(commands = ?connection.commands, "worker connected");
                    *inner.conn.lock().await = Some(Arc::new(connection));
                    return Ok(());
                }
                Err(TryConnectError::Fatal(failure)) => return Err(failure),
                Err(TryConnectError::Handshake(message)) => {
                    warn!(attempt, error = %message, "worker handshake failed");
                }
            }
        }
        Err(ConnectFailure::MaxAttempts)
    }

    async fn try_connect(inner: &Arc<Self>) -> Result<Connection, TryConnectError> {
        let mut child = Command::new(&inner.worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                TryConnectError::Fatal(ConnectFailure::Launch {
                    path: inner.worker_path.display().to_string(),
                    message: err.to_string(),
                })
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TryConnectError::Handshake("worker stdin pipe unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TryConnectError::Handshake("worker stdout pipe unavailable".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TryConnectError::Handshake("worker stderr pipe unavailable".to_string())
        })?;

        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireRequest>();
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);

        // Writer task: one ordered stream of request lines into the worker.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(request) = outbound_rx.recv().await {
                let line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "failed to encode request");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Worker diagnostics arrive on stderr; bridge them into our logs.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "capstan_pipeline::worker", "{line}");
            }
        });

        // Reader task: routes responses by request id, fans progress out to
        // subscribers, and tears the connection down at EOF. Dropping the
        // pending senders is what distinguishes a transport-level close
        // from a command-level failure.
        let reader_inner = Arc::clone(inner);
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WireOutbound>(&line) {
                        Ok(WireOutbound::Progress { event }) => {
                            let _ = reader_inner.progress_tx.send(event);
                        }
                        Ok(WireOutbound::Response {
                            request_id,
                            payload,
                        }) => match reader_pending.lock().await.remove(&request_id) {
                            Some(reply_tx) => {
                                let _ = reply_tx.send(payload.into_result());
                            }
                            None => debug!(request_id, "response for unknown request id"),
                        },
                        Err(err) => warn!(error = %err, "discarding malformed worker line"),
                    },
                    Ok(None) | Err(_) => break,
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            reader_pending.lock().await.clear();
            let mut conn = reader_inner.conn.lock().await;
            if conn
                .as_ref()
                .is_some_and(|existing| existing.generation == generation)
            {
                *conn = None;
            }
        });

        // Handshake: load the command surface once per connection.
        let hello = send_request(
            &inner.next_request_id,
            &pending,
            &outbound_tx,
            &closed,
            WorkerOp::Hello,
        );
        let commands = match tokio::time::timeout(HANDSHAKE_TIMEOUT, hello).await {
            Ok(Ok(Ok(WorkerResponse::Hello { commands }))) => commands,
            Ok(Ok(Ok(other))) => {
                return Err(TryConnectError::Handshake(format!(
                    "unexpected hello response: {other:?}"
                )));
            }
            Ok(Ok(Err(error))) => return Err(TryConnectError::Handshake(error.to_string())),
            Ok(Err(_)) => {
                return Err(TryConnectError::Handshake(
                    "worker closed during handshake".to_string(),
                ));
            }
            Err(_) => return Err(TryConnectError::Handshake("handshake timed out".to_string())),
        };

        Ok(Connection {
            generation,
            outbound_tx,
            pending,
            closed,
            commands,
            child: Mutex::new(child),
        })
    }
}

struct RequestClosed;

async fn send_request(
    next_request_id: &AtomicU64,
    pending: &PendingReplies,
    outbound_tx: &mpsc::UnboundedSender<WireRequest>,
    closed: &AtomicBool,
    op: WorkerOp,
) -> Result<WorkerReply, RequestClosed> {
    let request_id = next_request_id.fetch_add(1, Ordering::Relaxed);
    let (reply_tx, reply_rx) = oneshot::channel();
    pending.lock().await.insert(request_id, reply_tx);
    // Re-check after parking the reply sender: the reader drains the
    // pending map once, so an entry inserted after that drain would wait
    // forever.
    if closed.load(Ordering::SeqCst) || outbound_tx.send(WireRequest { request_id, op }).is_err() {
        pending.lock().await.remove(&request_id);
        return Err(RequestClosed);
    }
    reply_rx.await.map_err(|_| RequestClosed)
}
