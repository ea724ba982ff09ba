//! In-process fabric

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use super::{AgentName, Envelope, Fabric};
use crate::error::{RelayError, Result};

const INBOX_CAPACITY: usize = 1024;

/// Fabric whose agents all live in this process
///
/// Publishing needs a route in either direction between the two agents, so
/// a peer that set a route to a server can be answered without the server
/// registering one back.
#[derive(Clone, Default)]
pub struct LocalFabric {
    inboxes: Arc<DashMap<AgentName, mpsc::Sender<Envelope>>>,
    routes: Arc<DashSet<(AgentName, AgentName)>>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, name: &AgentName) -> bool {
        self.inboxes.contains_key(name)
    }

    fn has_route(&self, a: &AgentName, b: &AgentName) -> bool {
        self.routes.contains(&(a.clone(), b.clone())) || self.routes.contains(&(b.clone(), a.clone()))
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    async fn subscribe(&self, local: &AgentName) -> Result<mpsc::Receiver<Envelope>> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        if self.inboxes.insert(local.clone(), tx).is_some() {
            tracing::debug!("Replaced existing subscription for {}", local);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, local: &AgentName) -> Result<()> {
        self.inboxes.remove(local);
        self.routes.retain(|(from, _)| from != local);
        Ok(())
    }

    async fn set_route(&self, local: &AgentName, remote: &AgentName) -> Result<()> {
        self.routes.insert((local.clone(), remote.clone()));
        Ok(())
    }

    async fn publish(
        &self,
        source: &AgentName,
        destination: &AgentName,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !self.has_route(source, destination) {
            return Err(RelayError::Transport(format!(
                "no route from {} to {}",
                source, destination
            )));
        }
        let inbox = self
            .inboxes
            .get(destination)
            .map(|tx| tx.clone())
            .ok_or_else(|| RelayError::Transport(format!("{} is unreachable", destination)))?;

        inbox
            .send(Envelope {
                source: source.clone(),
                payload,
            })
            .await
            .map_err(|_| RelayError::Transport(format!("{} stopped receiving", destination)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> (AgentName, AgentName) {
        (
            AgentName::new("org", "mcp", "client1"),
            AgentName::new("org", "mcp", "proxy"),
        )
    }

    #[tokio::test]
    async fn test_publish_requires_route() {
        let fabric = LocalFabric::new();
        let (client, server) = names();
        let mut inbox = fabric.subscribe(&server).await.unwrap();

        let err = fabric
            .publish(&client, &server, b"hi".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        fabric.set_route(&client, &server).await.unwrap();
        fabric.publish(&client, &server, b"hi".to_vec()).await.unwrap();
        let env = inbox.recv().await.unwrap();
        assert_eq!(env.source, client);
        assert_eq!(env.payload, b"hi");
    }

    #[tokio::test]
    async fn test_reply_uses_reverse_route() {
        let fabric = LocalFabric::new();
        let (client, server) = names();
        let mut client_inbox = fabric.subscribe(&client).await.unwrap();
        fabric.set_route(&client, &server).await.unwrap();

        fabric.publish(&server, &client, b"reply".to_vec()).await.unwrap();
        assert_eq!(client_inbox.recv().await.unwrap().source, server);
    }

    #[tokio::test]
    async fn test_unsubscribe_makes_unreachable() {
        let fabric = LocalFabric::new();
        let (client, server) = names();
        let _inbox = fabric.subscribe(&server).await.unwrap();
        fabric.set_route(&client, &server).await.unwrap();
        fabric.unsubscribe(&server).await.unwrap();
        assert!(!fabric.is_subscribed(&server));
        assert!(fabric.publish(&client, &server, vec![]).await.is_err());
    }
}
