use super::{notification_payload, request_payload, PendingRequests, Transport, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Url};
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

/// Transport over a persistent SSE connection. The server's first `endpoint`
/// event names the POST target for JSON-RPC requests; responses arrive as
/// `message` events on the stream and are matched to requests by id.
pub struct SseTransport {
    inner: Arc<SseInner>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
}

struct SseInner {
    http: Client,
    post_url: Url,
    pending: PendingRequests,
    closed: AtomicBool,
}

impl SseTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let stream_url = Url::parse(url).map_err(|error| TransportError::Connect {
            url: url.to_string(),
            message: error.to_string(),
        })?;

        let mut source = EventSource::get(stream_url.clone());
        let post_url = tokio::time::timeout(ENDPOINT_WAIT, wait_for_endpoint(&mut source, &stream_url))
            .await
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                message: format!("no endpoint event within {}s", ENDPOINT_WAIT.as_secs()),
            })??;
        debug!(stream = %stream_url, endpoint = %post_url, "SSE endpoint negotiated");

        let inner = Arc::new(SseInner {
            http: Client::new(),
            post_url,
            pending: PendingRequests::new(),
            closed: AtomicBool::new(false),
        });

        let reader_inner = Arc::clone(&inner);
        let reader = tokio::spawn(async move {
            reader_inner.reader_loop(source).await;
        });

        Ok(Self {
            inner,
            reader: AsyncMutex::new(Some(reader)),
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (id, rx) = self.inner.pending.register();
        if let Err(error) = self.inner.post(&request_payload(id, method, params)).await {
            self.inner.pending.forget(id);
            return Err(error);
        }
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        self.inner.post(&notification_payload(method, params)).await
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let handle = { self.reader.lock().await.take() };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.pending.fail_all(|| TransportError::Closed);
    }
}

impl SseInner {
    async fn post(&self, message: &Value) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.post_url.clone())
            .json(message)
            .send()
            .await
            .map_err(|error| TransportError::Io {
                message: error.to_string(),
            })?;
        response.error_for_status().map_err(|error| TransportError::Io {
            message: error.to_string(),
        })?;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, mut source: EventSource) {
        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) if message.event == "message" => {
                    match serde_json::from_str::<Value>(&message.data) {
                        Ok(value) => self.pending.dispatch(value),
                        Err(source) => {
                            warn!(%source, "skipping invalid JSON event from server");
                        }
                    }
                }
                Ok(Event::Message(message)) => {
                    debug!(event = message.event.as_str(), "ignoring unrecognized SSE event");
                }
                Err(error) => {
                    warn!(%error, "event stream failed");
                    break;
                }
            }
        }
        source.close();
        debug!("event stream closed");
        self.closed.store(true, Ordering::SeqCst);
        self.pending.fail_all(|| TransportError::Closed);
    }
}

/// Consumes stream events until the server announces its POST endpoint,
/// resolving relative endpoints against the stream URL.
async fn wait_for_endpoint(
    source: &mut EventSource,
    stream_url: &Url,
) -> Result<Url, TransportError> {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {}
            Ok(Event::Message(message)) if message.event == "endpoint" => {
                return resolve_endpoint(stream_url, message.data.trim());
            }
            Ok(Event::Message(message)) => {
                debug!(event = message.event.as_str(), "ignoring pre-endpoint SSE event");
            }
            Err(error) => {
                return Err(TransportError::Connect {
                    url: stream_url.to_string(),
                    message: error.to_string(),
                });
            }
        }
    }
    Err(TransportError::Connect {
        url: stream_url.to_string(),
        message: "event stream ended before announcing an endpoint".into(),
    })
}

fn resolve_endpoint(stream_url: &Url, endpoint: &str) -> Result<Url, TransportError> {
    stream_url.join(endpoint).map_err(|error| TransportError::Connect {
        url: stream_url.to_string(),
        message: format!("invalid endpoint {endpoint:?}: {error}"),
    })
}
