use crate::application::registry::SessionRegistry;
use crate::domain::types::ChatMessage;
use crate::infrastructure::session::SessionError;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Uniform outcome of one tool invocation. Failures carry a human-readable
/// detail instead of an error type: a failed tool call is a legitimate
/// conversational event the model should be told about, not a fault.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocationResult {
    pub succeeded: bool,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ToolInvocationResult {
    fn success(payload: Value) -> Self {
        Self {
            succeeded: true,
            payload,
            error_detail: None,
        }
    }

    fn failure(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            payload: Value::Null,
            error_detail: Some(detail.into()),
        }
    }

    /// Folds the result into a tool-role message keyed by the model's call id.
    pub fn into_message(self, call_id: &str) -> ChatMessage {
        let content =
            serde_json::to_string(&self).unwrap_or_else(|_| "{\"succeeded\":false}".to_string());
        ChatMessage::tool(call_id, content)
    }
}

/// Translates a model-issued tool call into an RPC against the owning
/// provider session.
pub struct ToolRouter {
    registry: Arc<SessionRegistry>,
}

impl ToolRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn invoke(&self, qualified_name: &str, args_json: &str) -> ToolInvocationResult {
        let arguments = match parse_arguments(args_json) {
            Ok(arguments) => arguments,
            Err(detail) => {
                warn!(tool = qualified_name, detail = detail.as_str(), "rejecting tool call");
                return ToolInvocationResult::failure(detail);
            }
        };

        let (session, local_name) = match self.registry.resolve(qualified_name) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(tool = qualified_name, %error, "failed to route tool call");
                return ToolInvocationResult::failure(error.to_string());
            }
        };

        debug!(provider = session.name(), tool = local_name.as_str(), "invoking tool");
        match session.call_tool(&local_name, arguments).await {
            Ok(result) => {
                // Surface the content block when present, the raw result otherwise.
                let payload = result.get("content").cloned().unwrap_or(result);
                ToolInvocationResult::success(payload)
            }
            Err(error) => {
                warn!(tool = qualified_name, %error, "tool execution failed");
                // A transport failure leaves the session unusable; later
                // calls must fail to route rather than reach a dead channel.
                if matches!(error, SessionError::Transport { .. }) {
                    self.registry.evict(session.name()).await;
                }
                ToolInvocationResult::failure(error.to_string())
            }
        }
    }
}

/// Tool arguments must be a JSON object (or null, normalized to an empty
/// object). Anything else never reaches a session.
fn parse_arguments(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Null) => Ok(Value::Object(Default::default())),
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(format!(
            "invalid arguments: expected a JSON object, got {other}"
        )),
        Err(error) => Err(format!("invalid arguments: {error}")),
    }
}
