use crate::config::ServerConfig;
use crate::domain::types::ToolDescriptor;
use crate::infrastructure::transport::{self, Transport, TransportError};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to MCP server '{server}': {source}")]
    Connection {
        server: String,
        #[source]
        source: TransportError,
    },
    #[error("MCP server '{server}' transport failure: {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },
    #[error("MCP server '{server}' failed to run tool '{tool}': {message}")]
    Execution {
        server: String,
        tool: String,
        message: String,
    },
    #[error("MCP server '{server}' returned an invalid tool catalog: {message}")]
    InvalidCatalog { server: String, message: String },
}

/// One live connection to a tool provider. The registry, router, and tests
/// consume sessions through this trait so stub implementations can stand in
/// for real transports.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    fn name(&self) -> &str;
    fn tools(&self) -> &[ToolDescriptor];
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SessionError>;
    async fn close(&self);
}

pub struct McpSession {
    name: String,
    transport: Box<dyn Transport>,
    tools: Vec<ToolDescriptor>,
    // One in-flight request per provider; the transport is not assumed to
    // tolerate concurrent calls.
    call_lock: AsyncMutex<()>,
}

impl McpSession {
    /// Opens the transport, runs the MCP handshake, and snapshots the tool
    /// catalog. The catalog is never re-fetched for the life of the session.
    /// Connection failures propagate to the caller; retry is caller policy.
    pub async fn connect(config: &ServerConfig) -> Result<Self, SessionError> {
        let name = config.name.clone();
        let transport = transport::connect(config)
            .await
            .map_err(|source| SessionError::Connection {
                server: name.clone(),
                source,
            })?;

        // The transport is released even when the handshake fails partway.
        match handshake(&name, transport.as_ref()).await {
            Ok(tools) => {
                info!(server = %name, tools = tools.len(), "connected to MCP server");
                Ok(Self {
                    name,
                    transport,
                    tools,
                    call_lock: AsyncMutex::new(()),
                })
            }
            Err(error) => {
                transport.close().await;
                Err(error)
            }
        }
    }
}

async fn handshake(
    name: &str,
    transport: &dyn Transport,
) -> Result<Vec<ToolDescriptor>, SessionError> {
    let connection_error = |source| SessionError::Connection {
        server: name.to_string(),
        source,
    };

    let init = transport
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {},
            }),
        )
        .await
        .map_err(connection_error)?;
    if let Some(instructions) = init.get("instructions").and_then(Value::as_str) {
        debug!(server = %name, instructions, "server provided instructions");
    }

    transport
        .notify("notifications/initialized", json!({}))
        .await
        .map_err(connection_error)?;

    let listed = transport
        .request("tools/list", json!({}))
        .await
        .map_err(connection_error)?;
    parse_tool_catalog(name, &listed)
}

#[async_trait]
impl ProviderSession for McpSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SessionError> {
        let _guard = self.call_lock.lock().await;
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        });

        let result = match self.transport.request("tools/call", params).await {
            Ok(result) => result,
            Err(TransportError::Rpc { code, message }) => {
                return Err(SessionError::Execution {
                    server: self.name.clone(),
                    tool: tool.to_string(),
                    message: format!("{message} (code {code})"),
                });
            }
            Err(source) => {
                return Err(SessionError::Transport {
                    server: self.name.clone(),
                    source,
                });
            }
        };

        // Providers may report tool failure inside the result rather than as
        // a JSON-RPC error.
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            let message = content_text(&result)
                .unwrap_or_else(|| "tool reported failure without details".to_string());
            return Err(SessionError::Execution {
                server: self.name.clone(),
                tool: tool.to_string(),
                message,
            });
        }

        Ok(result)
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}

fn parse_tool_catalog(server: &str, listed: &Value) -> Result<Vec<ToolDescriptor>, SessionError> {
    let entries = listed
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| SessionError::InvalidCatalog {
            server: server.to_string(),
            message: "missing 'tools' array".into(),
        })?;

    let mut tools = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            warn!(server, "skipping catalog entry without a name");
            continue;
        };
        tools.push(ToolDescriptor {
            name: name.to_string(),
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: entry.get("inputSchema").cloned(),
        });
    }
    Ok(tools)
}

/// Joins the text fragments of an MCP tool result's content array.
fn content_text(result: &Value) -> Option<String> {
    let parts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
