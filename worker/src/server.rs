use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::warn;

use capstan_protocol::ResponsePayload;
use capstan_protocol::WireOutbound;
use capstan_protocol::WireRequest;
use capstan_protocol::WorkerOp;
use capstan_protocol::WorkerResponse;

use crate::process_manager::ProcessManager;
use crate::process_manager::ProgressStream;

/// Command names advertised in the hello response.
pub const COMMAND_SURFACE: [&str; 5] = ["execute", "spawn", "kill", "which", "path_exists"];

/// Serve requests over the process's stdin/stdout until stdin reaches EOF.
///
/// stdout carries the wire protocol exclusively; diagnostics go to stderr
/// via `tracing`.
pub async fn serve(manager: Arc<ProcessManager>) -> anyhow::Result<()> {
    run(tokio::io::stdin(), tokio::io::stdout(), manager).await
}

pub async fn run<R, W>(reader: R, writer: W, manager: Arc<ProcessManager>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireOutbound>();

    // Single writer task: progress and responses alike funnel through one
    // ordered channel, which is what guarantees a command's progress events
    // reach the wire before its terminal response.
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound_rx.recv().await {
            let line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "failed to encode outbound message");
                    continue;
                }
            };
            if write_line(&mut writer, &line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let request: WireRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(error = %err, "discarding malformed request line");
                        continue;
                    }
                };
                let manager = Arc::clone(&manager);
                let outbound = outbound_tx.clone();
                tokio::spawn(async move {
                    handle_request(manager, outbound, request).await;
                });
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stdin read failed; shutting down");
                break;
            }
        }
    }

    drop(outbound_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn handle_request(
    manager: Arc<ProcessManager>,
    outbound: mpsc::UnboundedSender<WireOutbound>,
    request: WireRequest,
) {
    let WireRequest { request_id, op } = request;
    let payload = match op {
        WorkerOp::Hello => ResponsePayload::ok(WorkerResponse::Hello {
            commands: COMMAND_SURFACE.map(str::to_string).to_vec(),
        }),
        WorkerOp::Execute {
            directory,
            command,
            args,
            command_id,
        } => {
            debug!(%command_id, command = %command, "execute");
            match manager.execute(&directory, &command, &args, command_id).await {
                Ok(output) => ResponsePayload::ok(WorkerResponse::Execute { output }),
                Err(err) => {
                    warn!(%command_id, error = %err, "execute failed");
                    ResponsePayload::err(err.to_command_error())
                }
            }
        }
        WorkerOp::Spawn {
            directory,
            command,
            args,
            command_id,
            watch_progress,
        } => {
            debug!(%command_id, command = %command, watch_progress, "spawn");
            let progress = watch_progress.then(|| ProgressStream {
                command_id,
                tx: outbound.clone(),
            });
            match manager
                .spawn(&directory, &command, &args, command_id, progress)
                .await
            {
                Ok(output) => ResponsePayload::ok(WorkerResponse::Spawn { output }),
                Err(err) => {
                    warn!(%command_id, error = %err, "spawn failed");
                    ResponsePayload::err(err.to_command_error())
                }
            }
        }
        WorkerOp::Kill { command_id } => match manager.kill(command_id).await {
            Ok(killed) => ResponsePayload::ok(WorkerResponse::Kill { killed }),
            Err(err) => {
                debug!(%command_id, error = %err, "kill refused");
                ResponsePayload::err(err.to_command_error())
            }
        },
        WorkerOp::Which { file_path } => match manager.which(&file_path).await {
            Ok(path) => ResponsePayload::ok(WorkerResponse::Which { path }),
            Err(err) => ResponsePayload::err(err.to_command_error()),
        },
        WorkerOp::PathExists { path } => ResponsePayload::ok(WorkerResponse::PathExists {
            exists: manager.path_exists(&path).await,
        }),
    };
    let _ = outbound.send(WireOutbound::Response {
        request_id,
        payload,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn next_outbound<R: AsyncBufReadExt + Unpin>(lines: &mut tokio::io::Lines<R>) -> WireOutbound {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            other => panic!("expected a response line, got {other:?}"),
        };
        match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => panic!("malformed outbound line {line:?}: {err}"),
        }
    }

    #[tokio::test]
    async fn hello_advertises_the_command_surface() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let server_task = tokio::spawn(run(server_read, server_write, Arc::new(ProcessManager::new())));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        client_write
            .write_all(b"{\"request_id\":1,\"op\":{\"type\":\"hello\"}}\n")
            .await
            .expect("write hello");

        match next_outbound(&mut lines).await {
            WireOutbound::Response {
                request_id,
                payload:
                    ResponsePayload::Ok {
                        response: WorkerResponse::Hello { commands },
                    },
            } => {
                assert_eq!(request_id, 1);
                assert!(commands.iter().any(|name| name == "execute"));
                assert!(commands.iter().any(|name| name == "path_exists"));
            }
            other => panic!("unexpected hello reply: {other:?}"),
        }

        client_write.shutdown().await.expect("shutdown client write");
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_and_service_continues() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let server_task = tokio::spawn(run(server_read, server_write, Arc::new(ProcessManager::new())));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        client_write
            .write_all(b"this is not json\n")
            .await
            .expect("write garbage");
        let probe = WireRequest {
            request_id: 2,
            op: WorkerOp::PathExists {
                path: PathBuf::from("/definitely/not/here"),
            },
        };
        let encoded = serde_json::to_string(&probe).expect("encode");
        client_write
            .write_all(format!("{encoded}\n").as_bytes())
            .await
            .expect("write probe");

        match next_outbound(&mut lines).await {
            WireOutbound::Response {
                request_id,
                payload:
                    ResponsePayload::Ok {
                        response: WorkerResponse::PathExists { exists },
                    },
            } => {
                assert_eq!(request_id, 2);
                assert!(!exists);
            }
            other => panic!("unexpected probe reply: {other:?}"),
        }

        client_write.shutdown().await.expect("shutdown client write");
        let _ = server_task.await;
    }
}
