//! Server half of the streamable HTTP transport
//!
//! Inbound messages arrive as POST bodies and are fed in with
//! [`StreamTransport::deliver`]. Outbound messages are routed to an SSE
//! body: the per-request stream opened for the POST that carried a request,
//! or the standalone stream opened by GET.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CloseSignal, Transport};
use crate::error::{RelayError, Result};
use crate::mcp::{Message, RequestId};

/// Receiving half of an outbound SSE body
pub type OutboundStream = mpsc::UnboundedReceiver<Message>;

pub struct StreamTransport {
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    request_streams: DashMap<RequestId, mpsc::UnboundedSender<Message>>,
    standalone: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    last_activity: Mutex<Instant>,
    closed: CloseSignal,
}

impl StreamTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            request_streams: DashMap::new(),
            standalone: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            closed: CloseSignal::new(),
        }
    }

    /// Hand a message received over HTTP to the session
    pub fn deliver(&self, message: Message) -> Result<()> {
        if self.closed.is_closed() {
            return Err(RelayError::SessionClosed);
        }
        self.touch();
        self.inbound_tx
            .send(message)
            .map_err(|_| RelayError::SessionClosed)
    }

    /// Open the body stream for a request; must precede its delivery
    ///
    /// The stream yields notifications tied to the request, then its
    /// response, and ends. Fails while another stream for the same id is
    /// still being read.
    pub fn open_request_stream(&self, id: RequestId) -> Result<OutboundStream> {
        self.touch();
        let (tx, rx) = mpsc::unbounded_channel();
        match self.request_streams.entry(id) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                Err(RelayError::DuplicateRequest(entry.key().clone()))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(tx);
                Ok(rx)
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Open the standalone stream for server-initiated messages
    ///
    /// Replaces any previous standalone stream.
    pub fn open_standalone_stream(&self) -> OutboundStream {
        self.touch();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.standalone.lock() = Some(tx);
        rx
    }

    pub fn open_request_streams(&self) -> usize {
        self.request_streams.len()
    }

    /// Time since the client last showed up, or `None` while any of its
    /// streams is still being read
    pub fn idle_for(&self) -> Option<Duration> {
        if self.request_streams.iter().any(|entry| !entry.value().is_closed()) {
            return None;
        }
        if self
            .standalone
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
        {
            return None;
        }
        Some(self.last_activity.lock().elapsed())
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn route(&self, message: Message) {
        let target = match &message {
            Message::Response(r) => Some(r.id.clone()),
            Message::Notification(n) => n.related_request_id.clone(),
            Message::Request(_) => None,
        };

        if let Some(id) = target {
            let ends_stream = matches!(message, Message::Response(_));
            let sent = match self.request_streams.get(&id) {
                Some(tx) => Some(tx.send(message.clone()).is_ok()),
                None => None,
            };
            match sent {
                Some(true) => {
                    if ends_stream {
                        // Dropping the sender ends the SSE body
                        self.request_streams.remove(&id);
                    }
                    return;
                }
                Some(false) => {
                    tracing::debug!("Request stream {} already gone", id);
                    self.request_streams.remove(&id);
                    if ends_stream {
                        return;
                    }
                }
                None if ends_stream => {
                    tracing::debug!("No open stream for response {}, dropping", id);
                    return;
                }
                None => {}
            }
        }

        let mut standalone = self.standalone.lock();
        let delivered = match standalone.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                tracing::debug!("No standalone stream open, dropping outbound message");
                return;
            }
        };
        if !delivered {
            tracing::debug!("Standalone stream closed by client");
            *standalone = None;
        }
    }
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn write(&self, message: Message) -> Result<()> {
        if self.closed.is_closed() {
            return Err(RelayError::Transport("stream transport closed".into()));
        }
        self.route(message);
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        if self.closed.is_closed() {
            return Ok(None);
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.closed() => Ok(None),
            message = rx.recv() => Ok(message),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.close();
        self.request_streams.clear();
        self.standalone.lock().take();
        Ok(())
    }

    fn peer(&self) -> String {
        "streamable-http".to_string()
    }
}
