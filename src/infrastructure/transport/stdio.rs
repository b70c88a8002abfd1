use super::{notification_payload, request_payload, PendingRequests, Transport, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Transport over a spawned child process: JSON-RPC messages are framed as
/// single newline-terminated lines on the child's standard streams. A
/// background task reads stdout and completes pending requests; losing the
/// stream fails everything in flight and marks the transport closed.
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    pending: PendingRequests,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    child: AsyncMutex<Option<Child>>,
}

impl StdioTransport {
    pub fn spawn(command_line: &str) -> Result<Self, TransportError> {
        let (program, args) = parse_command_line(command_line).ok_or_else(|| TransportError::Io {
            message: "server command is empty".into(),
        })?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| TransportError::Spawn { source })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Io {
            message: "failed to capture server stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Io {
            message: "failed to capture server stdout".into(),
        })?;

        let inner = Arc::new(StdioInner {
            pending: PendingRequests::new(),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            child: AsyncMutex::new(Some(child)),
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(stdout).await;
        });

        debug!(program = %program, "spawned MCP server process");
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let (id, rx) = self.inner.pending.register();
        if let Err(error) = self.inner.write_message(&request_payload(id, method, params)).await {
            self.inner.pending.forget(id);
            return Err(error);
        }
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        self.inner
            .write_message(&notification_payload(method, params))
            .await
    }

    async fn close(&self) {
        self.inner.shutdown().await;
    }
}

impl StdioInner {
    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(message) => self.pending.dispatch(message),
                        Err(source) => {
                            warn!(line = trimmed, %source, "skipping invalid JSON line from server");
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "failed to read from server stdout");
                    break;
                }
            }
        }
        debug!("server stdout closed");
        self.shutdown().await;
    }

    async fn write_message(&self, message: &Value) -> Result<(), TransportError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| TransportError::InvalidJson { source })?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::Closed)?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(io_failure)?;
        stream.write_all(b"\n").await.map_err(io_failure)?;
        stream.flush().await.map_err(io_failure)?;
        Ok(())
    }

    async fn shutdown(&self) {
        {
            let mut writer = self.writer.lock().await;
            writer.take();
        }

        let child = { self.child.lock().await.take() };
        if let Some(mut child) = child {
            if let Err(error) = child.kill().await {
                debug!(%error, "failed to kill server process (may have already exited)");
            }
            let _ = child.wait().await;
        }

        self.pending.fail_all(|| TransportError::Closed);
    }
}

fn io_failure(source: std::io::Error) -> TransportError {
    TransportError::Io {
        message: source.to_string(),
    }
}

/// Splits a shell-style command line on whitespace and expands a leading
/// home-directory shorthand in each argument.
fn parse_command_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = line.split_whitespace();
    let program = tokens.next()?.to_string();
    let args = tokens
        .map(|arg| shellexpand::tilde(arg).into_owned())
        .collect();
    Some((program, args))
}
