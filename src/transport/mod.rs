//! Transport abstraction beneath a session
//!
//! Every transport moves whole [`Message`]s, in order, at most once per
//! direction. Framing and addressing stay inside the implementation:
//!
//! - [`MemoryTransport`]: in-process duplex pair
//! - [`StreamTransport`]: server half of streamable HTTP (SSE out, POST in)
//! - [`HttpClientTransport`]: client half of streamable HTTP
//! - [`ChannelTransport`]: pub/sub fabric addressed by [`AgentName`](crate::fabric::AgentName)

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::mcp::Message;

pub mod channel;
pub mod http_client;
pub mod memory;
pub mod sse;
pub mod stream;

pub use channel::{ChannelListener, ChannelTransport};
pub use http_client::{HttpClientOptions, HttpClientTransport};
pub use memory::MemoryTransport;
pub use stream::StreamTransport;

/// Header carrying the HTTP session id, echoed by clients after `initialize`
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Ordered message pipe to one remote peer
///
/// `read` yields `Ok(None)` on end of stream. Errors for which
/// [`RelayError::is_fatal`](crate::error::RelayError::is_fatal) is false
/// (malformed input) leave the transport usable.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, message: Message) -> Result<()>;

    async fn read(&self) -> Result<Option<Message>>;

    async fn close(&self) -> Result<()>;

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// One-way latch shared by a transport's read and close paths
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn close(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close` has been called
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so wait_for only fails if self is gone
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_signal() {
        let signal = std::sync::Arc::new(CloseSignal::new());
        assert!(!signal.is_closed());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };
        signal.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_closed());

        // Already closed resolves immediately
        signal.closed().await;
    }
}
