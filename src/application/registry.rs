use crate::config::ServerConfig;
use crate::domain::types::{split_qualified, QualifiedTool};
use crate::infrastructure::session::{McpSession, ProviderSession};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("tool name '{name}' does not name a provider")]
    MalformedName { name: String },
    #[error("unknown provider '{provider}'")]
    UnknownProvider { provider: String },
}

/// Owns the set of live provider sessions keyed by provider name. The
/// registry is read-mostly after startup; the aggregated catalog is
/// recomputed on demand so it always reflects the current session set.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<dyn ProviderSession>>,
    // Connect order, for deterministic catalog aggregation.
    order: Vec<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects every enabled config concurrently. A single provider's
    /// failure is logged and that provider is simply absent; it never aborts
    /// the rest. Returns the number of sessions established.
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> usize {
        let attempts = configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| {
                let config = config.clone();
                async move {
                    let outcome = McpSession::connect(&config).await;
                    (config.name, outcome)
                }
            });

        let mut connected = 0;
        for (name, outcome) in join_all(attempts).await {
            match outcome {
                Ok(session) => {
                    self.register(Arc::new(session)).await;
                    connected += 1;
                }
                Err(error) => {
                    warn!(server = %name, %error, "skipping provider that failed to connect");
                }
            }
        }
        connected
    }

    /// Inserts one live session. A duplicate name replaces the previous
    /// session, which is closed.
    pub async fn register(&self, session: Arc<dyn ProviderSession>) {
        let name = session.name().to_string();
        let replaced = {
            let mut inner = self.inner.lock().expect("session registry lock");
            let replaced = inner.sessions.insert(name.clone(), session);
            if replaced.is_none() {
                inner.order.push(name.clone());
            }
            replaced
        };
        if let Some(old) = replaced {
            warn!(server = %name, "replacing existing session");
            old.close().await;
        }
    }

    pub fn has_active_sessions(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("session registry lock")
            .sessions
            .is_empty()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("session registry lock")
            .order
            .clone()
    }

    /// Flattens every live session's catalog in connect order, qualifying
    /// each local name with its provider prefix.
    pub fn aggregated_tools(&self) -> Vec<QualifiedTool> {
        let inner = self.inner.lock().expect("session registry lock");
        inner
            .order
            .iter()
            .filter_map(|name| inner.sessions.get(name))
            .flat_map(|session| {
                session
                    .tools()
                    .iter()
                    .map(|tool| QualifiedTool::qualify(session.name(), tool))
            })
            .collect()
    }

    /// Splits a qualified tool name and returns the owning session plus the
    /// provider-local tool name. A name that does not resolve to exactly one
    /// live session is a routing error; it never matches the wrong provider.
    pub fn resolve(
        &self,
        qualified: &str,
    ) -> Result<(Arc<dyn ProviderSession>, String), RoutingError> {
        let (provider, local) = split_qualified(qualified).ok_or_else(|| {
            RoutingError::MalformedName {
                name: qualified.to_string(),
            }
        })?;
        let session = self
            .inner
            .lock()
            .expect("session registry lock")
            .sessions
            .get(provider)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownProvider {
                provider: provider.to_string(),
            })?;
        Ok((session, local.to_string()))
    }

    /// Removes and closes one session. Used when a mid-session transport
    /// failure leaves a provider unusable: subsequent qualified names for it
    /// then fail to route instead of reaching a dead transport.
    pub async fn evict(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("session registry lock");
            inner.order.retain(|existing| existing != name);
            inner.sessions.remove(name)
        };
        match removed {
            Some(session) => {
                warn!(server = name, "evicting unusable session");
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every session, tolerating individual failures, and clears the
    /// mapping. The registry stays usable for a fresh `connect_all`.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<dyn ProviderSession>> = {
            let mut inner = self.inner.lock().expect("session registry lock");
            let order = std::mem::take(&mut inner.order);
            let mut sessions = std::mem::take(&mut inner.sessions);
            order
                .iter()
                .filter_map(|name| sessions.remove(name))
                .collect()
        };
        for session in &drained {
            session.close().await;
        }
        if !drained.is_empty() {
            info!(closed = drained.len(), "closed all provider sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerKind;
    use crate::domain::types::ToolDescriptor;
    use crate::infrastructure::session::SessionError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSession {
        name: String,
        tools: Vec<ToolDescriptor>,
        closed: AtomicUsize,
    }

    impl StubSession {
        fn new(name: &str, tool_names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools: tool_names
                    .iter()
                    .map(|tool| ToolDescriptor {
                        name: tool.to_string(),
                        description: None,
                        input_schema: None,
                    })
                    .collect(),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderSession for StubSession {
        fn name(&self) -> &str {
            &self.name
        }

        fn tools(&self) -> &[ToolDescriptor] {
            &self.tools
        }

        async fn call_tool(&self, _tool: &str, _arguments: Value) -> Result<Value, SessionError> {
            Ok(json!({ "content": [] }))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn aggregated_names_round_trip_through_resolve() {
        let registry = SessionRegistry::new();
        registry.register(StubSession::new("calc", &["add", "sub"])).await;
        registry.register(StubSession::new("files", &["read"])).await;

        for tool in registry.aggregated_tools() {
            let (session, local) = registry.resolve(&tool.name).expect("resolves");
            assert_eq!(session.name(), tool.provider);
            assert_eq!(local, tool.local_name);
        }
    }

    #[tokio::test]
    async fn aggregation_is_the_union_of_both_catalogs() {
        let registry = SessionRegistry::new();
        registry.register(StubSession::new("calc", &["add"])).await;
        registry.register(StubSession::new("files", &["read", "write"])).await;

        let names: Vec<String> = registry
            .aggregated_tools()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert_eq!(names, vec!["calc__add", "files__read", "files__write"]);
    }

    #[tokio::test]
    async fn failed_connect_leaves_other_providers_usable() {
        let registry = SessionRegistry::new();
        registry.register(StubSession::new("alpha", &["ping"])).await;

        let connected = registry
            .connect_all(&[ServerConfig {
                name: "beta".into(),
                kind: ServerKind::Command,
                command: Some("/nonexistent-mcp-server-binary".into()),
                url: None,
                enabled: true,
            }])
            .await;

        assert_eq!(connected, 0);
        assert!(registry.has_active_sessions());
        let names: Vec<String> = registry
            .aggregated_tools()
            .into_iter()
            .map(|tool| tool.provider)
            .collect();
        assert_eq!(names, vec!["alpha"]);
        assert!(matches!(
            registry.resolve("beta__ping"),
            Err(RoutingError::UnknownProvider { .. })
        ));
    }

    #[tokio::test]
    async fn disabled_providers_are_not_connected() {
        let registry = SessionRegistry::new();
        let connected = registry
            .connect_all(&[ServerConfig {
                name: "off".into(),
                kind: ServerKind::Command,
                command: Some("/nonexistent-mcp-server-binary".into()),
                url: None,
                enabled: false,
            }])
            .await;
        assert_eq!(connected, 0);
        assert!(!registry.has_active_sessions());
    }

    #[tokio::test]
    async fn resolve_rejects_malformed_and_unknown_names() {
        let registry = SessionRegistry::new();
        registry.register(StubSession::new("calc", &["add"])).await;

        assert!(matches!(
            registry.resolve("no-separator"),
            Err(RoutingError::MalformedName { .. })
        ));
        assert!(matches!(
            registry.resolve("other__add"),
            Err(RoutingError::UnknownProvider { .. })
        ));
    }

    #[tokio::test]
    async fn close_all_closes_sessions_and_allows_reuse() {
        let registry = SessionRegistry::new();
        let session = StubSession::new("calc", &["add"]);
        registry.register(session.clone()).await;

        registry.close_all().await;
        assert_eq!(session.closed.load(Ordering::SeqCst), 1);
        assert!(!registry.has_active_sessions());
        assert!(registry.aggregated_tools().is_empty());

        registry.register(StubSession::new("calc", &["add"])).await;
        assert!(registry.has_active_sessions());
    }

    #[tokio::test]
    async fn register_replaces_and_closes_duplicates() {
        let registry = SessionRegistry::new();
        let first = StubSession::new("calc", &["add"]);
        registry.register(first.clone()).await;
        registry.register(StubSession::new("calc", &["multiply"])).await;

        assert_eq!(first.closed.load(Ordering::SeqCst), 1);
        let names: Vec<String> = registry
            .aggregated_tools()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert_eq!(names, vec!["calc__multiply"]);
    }
}
