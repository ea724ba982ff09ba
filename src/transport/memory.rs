//! In-process duplex transport

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CloseSignal, Transport};
use crate::error::{RelayError, Result};
use crate::mcp::{codec, Message};

/// One end of an in-memory pipe carrying encoded frames
pub struct MemoryTransport {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CloseSignal,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new("memory-a", a_tx, a_rx), Self::new("memory-b", b_tx, b_rx))
    }

    fn new(
        name: &str,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CloseSignal::new(),
        }
    }

    /// Send raw bytes to the peer, bypassing the encoder
    pub fn write_raw(&self, bytes: Vec<u8>) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| RelayError::Transport("memory transport closed".into()))?;
        tx.send(bytes)
            .map_err(|_| RelayError::Transport("memory peer gone".into()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn write(&self, message: Message) -> Result<()> {
        let bytes = codec::encode(&message)?;
        self.write_raw(bytes)
    }

    async fn read(&self) -> Result<Option<Message>> {
        if self.closed.is_closed() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.closed() => Ok(None),
            frame = rx.recv() => match frame {
                Some(bytes) => codec::decode(&bytes).map(Some),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.close();
        self.tx.lock().take();
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{methods, Notification};
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_is_ordered() {
        let (a, b) = MemoryTransport::pair();
        for i in 0..3 {
            a.write(Notification::new(methods::LOG_MESSAGE, json!({"n": i})).into())
                .await
                .unwrap();
        }
        for i in 0..3 {
            match b.read().await.unwrap() {
                Some(Message::Notification(n)) => assert_eq!(n.params["n"], i),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_gives_peer_eof() {
        let (a, b) = MemoryTransport::pair();
        a.close().await.unwrap();
        assert!(b.read().await.unwrap().is_none());
        assert!(a.read().await.unwrap().is_none());
        assert!(a
            .write(Notification::new("x", json!({})).into())
            .await
            .unwrap_err()
            .is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let (a, b) = MemoryTransport::pair();
        a.write_raw(b"{oops".to_vec()).unwrap();
        let err = b.read().await.unwrap_err();
        assert!(!err.is_fatal());
    }
}
