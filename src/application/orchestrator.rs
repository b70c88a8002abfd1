use crate::application::registry::SessionRegistry;
use crate::application::router::ToolRouter;
use crate::domain::types::ChatMessage;
use crate::infrastructure::model::{ModelError, ModelProvider, ModelRequest};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_TURNS: usize = 8;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Upper bound on model completions per query. When the model is still
    /// requesting tools at the cap, the loop stops and returns the text
    /// accumulated so far instead of looping forever.
    pub max_turns: usize,
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: None,
        }
    }
}

/// Drives one user query to completion: submit history plus the aggregated
/// tool catalog to the model, execute any requested tools in order, fold the
/// results back into history, and repeat until the model answers with text
/// only or the turn cap is reached.
pub struct Orchestrator<P: ModelProvider> {
    provider: P,
    registry: Arc<SessionRegistry>,
    router: ToolRouter,
    model: String,
    options: OrchestratorOptions,
}

impl<P: ModelProvider> Orchestrator<P> {
    pub fn new(provider: P, registry: Arc<SessionRegistry>, model: impl Into<String>) -> Self {
        Self {
            provider,
            router: ToolRouter::new(registry.clone()),
            registry,
            model: model.into(),
            options: OrchestratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs one query. The conversation history lives only for this call;
    /// the returned string joins every assistant text fragment in turn order.
    pub async fn run(&self, query: impl Into<String>) -> Result<String, OrchestratorError> {
        let mut messages = Vec::new();
        if let Some(system) = &self.options.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(query));

        let mut collected: Vec<String> = Vec::new();
        for turn in 0..self.options.max_turns {
            let tools = self.registry.aggregated_tools();
            debug!(
                turn,
                tools = tools.len(),
                history = messages.len(),
                "requesting completion"
            );
            let response = self
                .provider
                .chat(ModelRequest {
                    model: self.model.clone(),
                    messages: messages.clone(),
                    tools,
                })
                .await?;

            collected.extend(response.text_fragments.iter().cloned());
            let turn_text = response.text_fragments.join("\n");

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(turn_text));
                info!(turns = turn + 1, "query complete");
                return Ok(collected.join("\n"));
            }

            messages.push(ChatMessage::assistant_with_calls(
                turn_text,
                response.tool_calls.clone(),
            ));

            // Tool calls run sequentially in request order: conversation
            // ordering stays deterministic and provider state mutations never
            // interleave.
            for call in &response.tool_calls {
                info!(tool = %call.name, "model requested tool invocation");
                let result = self.router.invoke(&call.name, &call.arguments).await;
                if !result.succeeded {
                    warn!(
                        tool = %call.name,
                        detail = result.error_detail.as_deref().unwrap_or("unknown"),
                        "tool invocation failed; result fed back to the model"
                    );
                }
                messages.push(result.into_message(&call.id));
            }
        }

        warn!(
            max_turns = self.options.max_turns,
            "turn cap reached; returning accumulated text"
        );
        Ok(collected.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{MessageRole, ToolCallRequest, ToolDescriptor};
    use crate::infrastructure::model::ModelResponse;
    use crate::infrastructure::session::{ProviderSession, SessionError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Clone)]
    struct ScriptedModel {
        responses: Arc<AsyncMutex<VecDeque<ModelResponse>>>,
        requests: Arc<AsyncMutex<Vec<ModelRequest>>>,
        fallback: ModelResponse,
    }

    impl ScriptedModel {
        fn new(responses: Vec<ModelResponse>) -> Self {
            Self {
                responses: Arc::new(AsyncMutex::new(responses.into())),
                requests: Arc::new(AsyncMutex::new(Vec::new())),
                fallback: ModelResponse::default(),
            }
        }

        /// A model that answers every request identically.
        fn repeating(response: ModelResponse) -> Self {
            Self {
                responses: Arc::new(AsyncMutex::new(VecDeque::new())),
                requests: Arc::new(AsyncMutex::new(Vec::new())),
                fallback: response,
            }
        }

        async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
            self.requests.lock().await.push(request);
            let next = self.responses.lock().await.pop_front();
            Ok(next.unwrap_or_else(|| self.fallback.clone()))
        }
    }

    struct CountingSession {
        name: String,
        tools: Vec<ToolDescriptor>,
        calls: AsyncMutex<Vec<(String, Value)>>,
        fail: bool,
    }

    impl CountingSession {
        fn new(name: &str, tool: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools: vec![ToolDescriptor {
                    name: tool.to_string(),
                    description: None,
                    input_schema: None,
                }],
                calls: AsyncMutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl ProviderSession for CountingSession {
        fn name(&self) -> &str {
            &self.name
        }

        fn tools(&self) -> &[ToolDescriptor] {
            &self.tools
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SessionError> {
            self.calls.lock().await.push((tool.to_string(), arguments));
            if self.fail {
                Err(SessionError::Execution {
                    server: self.name.clone(),
                    tool: tool.to_string(),
                    message: "stub failure".into(),
                })
            } else {
                Ok(json!({ "content": [{ "type": "text", "text": "4" }] }))
            }
        }

        async fn close(&self) {}
    }

    fn text_response(text: &str) -> ModelResponse {
        ModelResponse {
            text_fragments: vec![text.to_string()],
            tool_calls: Vec::new(),
        }
    }

    fn tool_response(name: &str, arguments: &str) -> ModelResponse {
        ModelResponse {
            text_fragments: Vec::new(),
            tool_calls: vec![ToolCallRequest {
                id: "call-1".into(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn text_only_answer_completes_in_one_turn() {
        let model = ScriptedModel::new(vec![text_response("4")]);
        let registry = Arc::new(SessionRegistry::new());
        let orchestrator = Orchestrator::new(model.clone(), registry, "test-model");

        let answer = orchestrator.run("what is 2+2").await.expect("answer");
        assert_eq!(answer, "4");
        assert_eq!(model.request_count().await, 1);
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_completion() {
        let model = ScriptedModel::new(vec![
            tool_response("calc__add", "{\"a\":2,\"b\":2}"),
            text_response("The answer is 4"),
        ]);
        let registry = Arc::new(SessionRegistry::new());
        let session = CountingSession::new("calc", "add", false);
        registry.register(session.clone()).await;
        let orchestrator = Orchestrator::new(model.clone(), registry, "test-model");

        let answer = orchestrator.run("add 2 and 2").await.expect("answer");
        assert_eq!(answer, "The answer is 4");

        let calls = session.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "add");
        assert_eq!(calls[0].1, json!({ "a": 2, "b": 2 }));

        // The second completion saw the assistant's call and the tool result.
        let requests = model.requests.lock().await;
        assert_eq!(requests.len(), 2);
        let roles: Vec<MessageRole> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::Tool]
        );
        assert_eq!(
            requests[1].messages[2].tool_call_id.as_deref(),
            Some("call-1")
        );
    }

    #[tokio::test]
    async fn failed_tool_calls_do_not_abort_the_query() {
        let model = ScriptedModel::new(vec![
            tool_response("calc__add", "{\"a\":2,\"b\":2}"),
            text_response("I could not compute that"),
        ]);
        let registry = Arc::new(SessionRegistry::new());
        let session = CountingSession::new("calc", "add", true);
        registry.register(session.clone()).await;
        let orchestrator = Orchestrator::new(model.clone(), registry, "test-model");

        let answer = orchestrator.run("add 2 and 2").await.expect("answer");
        assert_eq!(answer, "I could not compute that");
        assert_eq!(model.request_count().await, 2);

        // The failure reached the model as data.
        let requests = model.requests.lock().await;
        let folded: Value =
            serde_json::from_str(&requests[1].messages[2].content).expect("valid JSON");
        assert_eq!(folded["succeeded"], json!(false));
    }

    #[tokio::test]
    async fn turn_cap_stops_a_model_that_always_requests_tools() {
        let model = ScriptedModel::repeating(ModelResponse {
            text_fragments: vec!["working on it".into()],
            tool_calls: vec![ToolCallRequest {
                id: "call-1".into(),
                name: "calc__add".into(),
                arguments: "{}".into(),
            }],
        });
        let registry = Arc::new(SessionRegistry::new());
        registry.register(CountingSession::new("calc", "add", false)).await;
        let orchestrator = Orchestrator::new(model.clone(), registry, "test-model").with_options(
            OrchestratorOptions {
                max_turns: 3,
                system_prompt: None,
            },
        );

        let answer = orchestrator.run("loop forever").await.expect("answer");
        assert_eq!(model.request_count().await, 3);
        assert_eq!(answer, "working on it\nworking on it\nworking on it");
    }

    #[tokio::test]
    async fn system_prompt_leads_the_history() {
        let model = ScriptedModel::new(vec![text_response("ok")]);
        let registry = Arc::new(SessionRegistry::new());
        let orchestrator = Orchestrator::new(model.clone(), registry, "test-model").with_options(
            OrchestratorOptions {
                max_turns: DEFAULT_MAX_TURNS,
                system_prompt: Some("be terse".into()),
            },
        );

        orchestrator.run("hello").await.expect("answer");
        let requests = model.requests.lock().await;
        assert_eq!(requests[0].messages[0].role, MessageRole::System);
        assert_eq!(requests[0].messages[0].content, "be terse");
    }
}
