//! Pub/sub channel transport
//!
//! A [`ChannelTransport`] talks to exactly one remote [`AgentName`]. Clients
//! build one with [`ChannelTransport::connect`]; servers receive one per new
//! peer from a [`ChannelListener`], which demultiplexes the shared inbox by
//! source address.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{CloseSignal, Transport};
use crate::error::{RelayError, Result};
use crate::fabric::{AgentName, Envelope, Fabric};
use crate::mcp::{codec, Message};

const PEER_QUEUE_CAPACITY: usize = 256;

type PeerTable = Arc<DashMap<AgentName, mpsc::Sender<Envelope>>>;

pub struct ChannelTransport {
    fabric: Arc<dyn Fabric>,
    local: AgentName,
    remote: AgentName,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    /// Set for listener-accepted transports; the entry is removed on close
    peers: Option<PeerTable>,
    closed: CloseSignal,
}

impl ChannelTransport {
    /// Subscribe `local` and route it to `remote`
    pub async fn connect(
        fabric: Arc<dyn Fabric>,
        local: AgentName,
        remote: AgentName,
    ) -> Result<Self> {
        let inbox = fabric.subscribe(&local).await?;
        fabric.set_route(&local, &remote).await?;
        tracing::debug!("Channel route {} -> {} established", local, remote);
        Ok(Self {
            fabric,
            local,
            remote,
            inbox: tokio::sync::Mutex::new(inbox),
            peers: None,
            closed: CloseSignal::new(),
        })
    }

    fn accepted(
        fabric: Arc<dyn Fabric>,
        local: AgentName,
        remote: AgentName,
        inbox: mpsc::Receiver<Envelope>,
        peers: PeerTable,
    ) -> Self {
        Self {
            fabric,
            local,
            remote,
            inbox: tokio::sync::Mutex::new(inbox),
            peers: Some(peers),
            closed: CloseSignal::new(),
        }
    }

    pub fn local(&self) -> &AgentName {
        &self.local
    }

    pub fn remote(&self) -> &AgentName {
        &self.remote
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, message: Message) -> Result<()> {
        if self.closed.is_closed() {
            return Err(RelayError::Transport("channel transport closed".into()));
        }
        let payload = codec::encode(&message)?;
        self.fabric.publish(&self.local, &self.remote, payload).await
    }

    async fn read(&self) -> Result<Option<Message>> {
        let mut inbox = self.inbox.lock().await;
        loop {
            if self.closed.is_closed() {
                return Ok(None);
            }
            let envelope = tokio::select! {
                _ = self.closed.closed() => return Ok(None),
                envelope = inbox.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                return Ok(None);
            };
            if envelope.source != self.remote {
                tracing::debug!(
                    "Dropping message from {} on channel to {}",
                    envelope.source,
                    self.remote
                );
                continue;
            }
            return codec::decode(&envelope.payload).map(Some);
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_closed() {
            return Ok(());
        }
        self.closed.close();
        match &self.peers {
            Some(peers) => {
                peers.remove(&self.remote);
            }
            None => self.fabric.unsubscribe(&self.local).await?,
        }
        Ok(())
    }

    fn peer(&self) -> String {
        self.remote.to_string()
    }
}

/// Accepts one [`ChannelTransport`] per new source address
pub struct ChannelListener {
    fabric: Arc<dyn Fabric>,
    local: AgentName,
    inbox: mpsc::Receiver<Envelope>,
    peers: PeerTable,
}

impl ChannelListener {
    pub async fn bind(fabric: Arc<dyn Fabric>, local: AgentName) -> Result<Self> {
        let inbox = fabric.subscribe(&local).await?;
        tracing::info!("Listening for channel peers as {}", local);
        Ok(Self {
            fabric,
            local,
            inbox,
            peers: Arc::new(DashMap::new()),
        })
    }

    pub fn local(&self) -> &AgentName {
        &self.local
    }

    /// Number of peers with a live transport
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Forward inbound traffic until a new peer shows up
    ///
    /// Must be polled continuously: known peers only receive their messages
    /// while this is awaited. Returns `None` once the fabric inbox closes.
    pub async fn accept(&mut self) -> Option<ChannelTransport> {
        while let Some(envelope) = self.inbox.recv().await {
            let source = envelope.source.clone();

            let known = self.peers.get(&source).map(|tx| tx.clone());
            let envelope = match known {
                Some(tx) => match tx.try_send(envelope) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("Peer {} is not keeping up, dropping message", source);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(envelope)) => {
                        // Session ended; a fresh message starts a new one
                        self.peers.remove(&source);
                        envelope
                    }
                },
                None => envelope,
            };

            let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
            if tx.try_send(envelope).is_err() {
                continue;
            }
            self.peers.insert(source.clone(), tx);
            tracing::info!("New channel peer {}", source);
            return Some(ChannelTransport::accepted(
                self.fabric.clone(),
                self.local.clone(),
                source,
                rx,
                self.peers.clone(),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LocalFabric;
    use crate::mcp::{methods, Notification, Request};
    use serde_json::json;

    fn setup() -> (Arc<dyn Fabric>, AgentName, AgentName) {
        (
            Arc::new(LocalFabric::new()),
            AgentName::new("org", "mcp", "client1"),
            AgentName::new("org", "mcp", "proxy"),
        )
    }

    #[tokio::test]
    async fn test_listener_accepts_per_peer() {
        let (fabric, client_name, server_name) = setup();
        let mut listener = ChannelListener::bind(fabric.clone(), server_name.clone())
            .await
            .unwrap();

        let client = ChannelTransport::connect(fabric.clone(), client_name.clone(), server_name)
            .await
            .unwrap();
        client
            .write(Request::new(1_i64, methods::PING, json!({})).into())
            .await
            .unwrap();

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.remote(), &client_name);
        assert_eq!(listener.peer_count(), 1);
        let msg = accepted.read().await.unwrap().unwrap();
        assert_eq!(msg.method(), Some(methods::PING));

        accepted
            .write(Notification::new(methods::LOG_MESSAGE, json!({})).into())
            .await
            .unwrap();
        let reply = client.read().await.unwrap().unwrap();
        assert_eq!(reply.method(), Some(methods::LOG_MESSAGE));

        accepted.close().await.unwrap();
        assert_eq!(listener.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_unsubscribes_on_close() {
        let fabric = LocalFabric::new();
        let client_name = AgentName::new("org", "mcp", "client1");
        let server_name = AgentName::new("org", "mcp", "proxy");
        let client = ChannelTransport::connect(
            Arc::new(fabric.clone()),
            client_name.clone(),
            server_name,
        )
        .await
        .unwrap();
        assert!(fabric.is_subscribed(&client_name));
        client.close().await.unwrap();
        assert!(!fabric.is_subscribed(&client_name));
        assert!(client.read().await.unwrap().is_none());
    }
}
