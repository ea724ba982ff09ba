//! Client half of the streamable HTTP transport
//!
//! Each outbound message is one POST. `write` only queues the message; a
//! background sender task issues the POSTs and pumps bodies (a JSON message,
//! a JSON array, or an SSE stream) into the inbound queue. Failures surface
//! through `read` as fatal transport errors.
//!
//! Until the server assigns a session id, POSTs go out one at a time so
//! later messages carry the header. After that, notifications and responses
//! are posted in queue order, while each request gets its own task because
//! the server may hold its reply until the handler finishes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::sse::SseDecoder;
use super::{CloseSignal, Transport, SESSION_HEADER};
use crate::error::{RelayError, Result};
use crate::mcp::{codec, Message};

type Inbound = Result<Message>;

/// Options for [`HttpClientTransport`]
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// Open the GET event stream as soon as the server assigns a session
    pub open_event_stream: bool,
    pub connect_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            open_event_stream: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One encoded message waiting to be POSTed
struct Outbound {
    body: Vec<u8>,
    awaits_reply: bool,
}

/// State shared between the transport and its background tasks
struct Shared {
    client: reqwest::Client,
    endpoint: String,
    options: HttpClientOptions,
    session_id: RwLock<Option<String>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: CloseSignal,
}

pub struct HttpClientTransport {
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl HttpClientTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_options(endpoint, HttpClientOptions::default())
    }

    pub fn with_options(endpoint: impl Into<String>, options: HttpClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                endpoint: endpoint.into(),
                options,
                session_id: RwLock::new(None),
                inbound_tx,
                tasks: Mutex::new(Vec::new()),
                closed: CloseSignal::new(),
            }),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Session id assigned by the server, once known
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    /// Open the standalone GET stream for server-initiated messages
    pub async fn open_event_stream(&self) -> Result<()> {
        self.shared.open_event_stream().await
    }

    /// Start the sender task on first use
    fn ensure_sender(&self) {
        let Some(outbound) = self.outbound_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(run_sender(self.shared.clone(), outbound));
        self.shared.track(handle);
    }
}

impl Shared {
    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn track(&self, handle: JoinHandle<()>) {
        if self.closed.is_closed() {
            handle.abort();
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn spawn_pump(&self, response: reqwest::Response) {
        let handle = tokio::spawn(pump_body(response, self.inbound_tx.clone()));
        self.track(handle);
    }

    fn report(&self, err: RelayError) {
        tracing::error!("POST to {} failed: {}", self.endpoint, err);
        let _ = self.inbound_tx.send(Err(err));
    }

    async fn open_event_stream(&self) -> Result<()> {
        let session_id = self
            .session_id()
            .ok_or_else(|| RelayError::Protocol("no session assigned yet".into()))?;

        let response = self
            .client
            .get(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .header(SESSION_HEADER, session_id)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!("Server at {} offers no event stream", self.endpoint);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "HTTP {} opening event stream at {}",
                response.status(),
                self.endpoint
            )));
        }

        self.spawn_pump(response);
        Ok(())
    }

    /// Record the session header; true when it was assigned just now
    fn capture_session(&self, response: &reqwest::Response) -> bool {
        let Some(value) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let mut guard = self.session_id.write();
        let first = guard.is_none();
        *guard = Some(value.to_string());
        first
    }

    /// POST one body; yields the response when it carries messages
    async fn post(&self, body: Vec<u8>) -> Result<Option<reqwest::Response>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "HTTP {} from {}",
                status, self.endpoint
            )));
        }

        if self.capture_session(&response) && self.options.open_event_stream {
            if let Err(e) = self.open_event_stream().await {
                tracing::warn!("Could not open event stream: {}", e);
            }
        }

        Ok((status != StatusCode::ACCEPTED).then_some(response))
    }
}

fn transport_error(err: reqwest::Error) -> RelayError {
    RelayError::Transport(err.to_string())
}

async fn run_sender(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(next) = outbound.recv().await {
        if next.awaits_reply && shared.session_id().is_some() {
            let task_shared = shared.clone();
            let handle = tokio::spawn(async move {
                match task_shared.post(next.body).await {
                    Ok(Some(response)) => pump_body(response, task_shared.inbound_tx.clone()).await,
                    Ok(None) => {}
                    Err(e) => task_shared.report(e),
                }
            });
            shared.track(handle);
            continue;
        }

        match shared.post(next.body).await {
            Ok(Some(response)) => shared.spawn_pump(response),
            Ok(None) => {}
            Err(e) => shared.report(e),
        }
    }
}

async fn pump_body(response: reqwest::Response, tx: mpsc::UnboundedSender<Inbound>) {
    let is_sse = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_sse {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        let _ = tx.send(codec::decode(event.as_bytes()));
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(transport_error(e)));
                    return;
                }
            }
        }
        if let Some(event) = decoder.finish() {
            let _ = tx.send(codec::decode(event.as_bytes()));
        }
        return;
    }

    match response.bytes().await {
        Ok(bytes) if bytes.is_empty() => {}
        Ok(bytes) => match codec::decode_batch(&bytes) {
            Ok(messages) => {
                for message in messages {
                    let _ = tx.send(Ok(message));
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        },
        Err(e) => {
            let _ = tx.send(Err(transport_error(e)));
        }
    }
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn write(&self, message: Message) -> Result<()> {
        if self.shared.closed.is_closed() {
            return Err(RelayError::Transport("http transport closed".into()));
        }

        let outbound = Outbound {
            awaits_reply: matches!(message, Message::Request(_)),
            body: codec::encode(&message)?,
        };
        self.ensure_sender();
        self.outbound_tx
            .send(outbound)
            .map_err(|_| RelayError::Transport("http sender stopped".into()))
    }

    async fn read(&self) -> Result<Option<Message>> {
        if self.shared.closed.is_closed() {
            return Ok(None);
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.shared.closed.closed() => Ok(None),
            inbound = rx.recv() => match inbound {
                Some(message) => message.map(Some),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.is_closed() {
            return Ok(());
        }
        self.shared.closed.close();
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(session_id) = self.session_id() {
            let result = self
                .shared
                .client
                .delete(&self.shared.endpoint)
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(
                    "Session DELETE to {} failed: {}",
                    self.shared.endpoint,
                    e
                );
            }
        }
        Ok(())
    }

    fn peer(&self) -> String {
        self.shared.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{methods, Notification, Request};
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let transport = HttpClientTransport::new("http://127.0.0.1:1/mcp").unwrap();
        assert!(transport.session_id().is_none());
        assert_eq!(transport.peer(), "http://127.0.0.1:1/mcp");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_fatal() {
        // Port 1 is reserved and refuses connections
        let transport = HttpClientTransport::new("http://127.0.0.1:1/mcp").unwrap();
        transport
            .write(Request::new(1_i64, methods::INITIALIZE, json!({})).into())
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), transport.read())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let transport = HttpClientTransport::new("http://127.0.0.1:1/mcp").unwrap();
        transport.close().await.unwrap();
        let err = transport
            .write(Notification::new(methods::INITIALIZED, json!({})).into())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_closed_transport_reads_eof() {
        let transport = HttpClientTransport::new("http://127.0.0.1:1/mcp").unwrap();
        transport.close().await.unwrap();
        assert!(transport.read().await.unwrap().is_none());
    }
}
