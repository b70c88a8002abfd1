pub mod sse;
pub mod stdio;

use crate::config::{ServerConfig, ServerKind};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn server process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open stream connection to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("transport I/O failure: {message}")]
    Io { message: String },
    #[error("server sent invalid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("server returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport is closed")]
    Closed,
}

/// Request/response channel to one tool provider. Implementations frame
/// JSON-RPC 2.0 messages over their medium and match responses to requests
/// by id. `close` is idempotent and best-effort.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;
    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Opens the transport variant selected by the server configuration.
pub async fn connect(config: &ServerConfig) -> Result<Box<dyn Transport>, TransportError> {
    match config.kind {
        ServerKind::Command => {
            let command = config.command.as_deref().unwrap_or_default();
            Ok(Box::new(stdio::StdioTransport::spawn(command)?))
        }
        ServerKind::Stream => {
            let url = config.url.as_deref().unwrap_or_default();
            Ok(Box::new(sse::SseTransport::connect(url).await?))
        }
    }
}

/// In-flight request table shared by both transport variants: requests
/// register a oneshot slot keyed by a monotonically increasing id, and the
/// background reader completes the slot when the matching response arrives.
pub(crate) struct PendingRequests {
    slots: Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>,
    next_id: AtomicU64,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Result<Value, TransportError>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().expect("pending request lock").insert(id, tx);
        (id, rx)
    }

    pub(crate) fn forget(&self, id: u64) {
        self.slots.lock().expect("pending request lock").remove(&id);
    }

    /// Routes one inbound JSON-RPC message. Responses complete their pending
    /// slot; notifications and server-initiated requests are logged and
    /// dropped (this client never registers server-callable capabilities).
    pub(crate) fn dispatch(&self, message: Value) {
        let id = match response_id(&message) {
            Some(id) if message.get("method").is_none() => id,
            _ => {
                debug!(
                    method = message.get("method").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    "ignoring non-response message from server"
                );
                return;
            }
        };

        let slot = self.slots.lock().expect("pending request lock").remove(&id);
        let Some(sender) = slot else {
            debug!(response_id = id, "received response for unknown request");
            return;
        };

        let outcome = match message.get("error") {
            Some(error) => Err(TransportError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    /// Fails every in-flight request; used when the underlying channel dies.
    pub(crate) fn fail_all(&self, make_error: impl Fn() -> TransportError) {
        let mut slots = self.slots.lock().expect("pending request lock");
        for (_, sender) in slots.drain() {
            let _ = sender.send(Err(make_error()));
        }
    }
}

fn response_id(message: &Value) -> Option<u64> {
    match message.get("id") {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.parse().ok(),
        _ => None,
    }
}

pub(crate) fn request_payload(id: u64, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub(crate) fn notification_payload(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}
