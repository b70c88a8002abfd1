use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Separator between the provider prefix and the local tool name in a
/// qualified tool name. Provider names are validated at configuration load
/// time so the separator can never occur inside either component.
pub const TOOL_NAME_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// A single tool invocation requested by the model. `name` is a qualified
/// tool name and `arguments` is the raw JSON payload exactly as the model
/// produced it; parsing happens at the router boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn assistant_with_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// One entry of a provider's tool catalog, snapshotted at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// A tool descriptor exposed to the model under a globally unique name.
#[derive(Debug, Clone, PartialEq)]
pub struct QualifiedTool {
    pub name: String,
    pub provider: String,
    pub local_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl QualifiedTool {
    pub fn qualify(provider: &str, tool: &ToolDescriptor) -> Self {
        let description = match tool.description.as_deref() {
            Some(text) if !text.is_empty() => format!("[{provider}] {text}"),
            _ => format!("[{provider}] {}", tool.name),
        };
        Self {
            name: format!("{provider}{TOOL_NAME_SEPARATOR}{}", tool.name),
            provider: provider.to_string(),
            local_name: tool.name.clone(),
            description,
            input_schema: tool
                .input_schema
                .clone()
                .unwrap_or_else(|| json!({ "type": "object" })),
        }
    }
}

/// Splits a qualified tool name into its provider and local components.
/// Returns `None` when the separator is absent or either side is empty.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(TOOL_NAME_SEPARATOR)
        .filter(|(provider, local)| !provider.is_empty() && !local.is_empty())
}
