//! Channel-to-HTTP proxy
//!
//! Accepts MCP sessions from pub/sub peers and bridges each one to an
//! upstream streamable HTTP server. Messages are relayed verbatim; the proxy
//! only adds keep-alive pings towards the peer.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::MissedTickBehavior;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::fabric::Fabric;
use crate::mcp::{methods, Message, Request, RequestId};
use crate::transport::{
    ChannelListener, ChannelTransport, HttpClientOptions, HttpClientTransport, Transport,
};

/// Opens the upstream leg of a bridge
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// Connects to a streamable HTTP endpoint
pub struct HttpConnector {
    endpoint: String,
}

impl HttpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl UpstreamConnector for HttpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let options = HttpClientOptions {
            open_event_stream: true,
            ..HttpClientOptions::default()
        };
        Ok(Arc::new(HttpClientTransport::with_options(
            self.endpoint.clone(),
            options,
        )?))
    }
}

pub struct Proxy {
    config: ProxyConfig,
    fabric: Arc<dyn Fabric>,
    connector: Arc<dyn UpstreamConnector>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, fabric: Arc<dyn Fabric>) -> Self {
        let connector = Arc::new(HttpConnector::new(config.server_url.clone()));
        Self::with_connector(config, fabric, connector)
    }

    pub fn with_connector(
        config: ProxyConfig,
        fabric: Arc<dyn Fabric>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            config,
            fabric,
            connector,
        }
    }

    /// Accept peers until `shutdown` resolves or the fabric inbox closes
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let mut listener = ChannelListener::bind(self.fabric.clone(), self.config.local.clone()).await?;
        tracing::info!(
            "Proxy {} forwarding to {}",
            self.config.local,
            self.config.server_url
        );

        tokio::pin!(shutdown);
        loop {
            let peer = tokio::select! {
                _ = &mut shutdown => break,
                peer = listener.accept() => peer,
            };
            let Some(peer) = peer else {
                break;
            };
            let upstream = match self.connector.connect().await {
                Ok(upstream) => upstream,
                Err(e) => {
                    tracing::error!("Could not reach MCP server for {}: {}", peer.remote(), e);
                    let _ = peer.close().await;
                    continue;
                }
            };
            let bridge = Bridge {
                peer: Arc::new(peer),
                upstream,
                ping_interval: self.config.ping_interval,
                max_pending_pings: self.config.max_pending_pings,
            };
            tokio::spawn(bridge.run());
        }
        tracing::info!("Proxy {} stopped", self.config.local);
        Ok(())
    }
}

struct Bridge {
    peer: Arc<ChannelTransport>,
    upstream: Arc<dyn Transport>,
    ping_interval: Duration,
    max_pending_pings: usize,
}

impl Bridge {
    async fn run(self) {
        let remote = self.peer.remote().clone();
        tracing::info!("Bridging {} to {}", remote, self.upstream.peer());

        let mut pending_pings: HashSet<RequestId> = HashSet::new();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if pending_pings.len() >= self.max_pending_pings {
                        tracing::info!("{} stopped answering pings, closing", remote);
                        break;
                    }
                    let id = RequestId::Number(i64::from(rand::random::<u32>()));
                    pending_pings.insert(id.clone());
                    let ping = Request::new(id, methods::PING, json!({}));
                    if let Err(e) = self.peer.write(ping.into()).await {
                        tracing::error!("Ping to {} failed: {}", remote, e);
                    }
                }
                inbound = self.peer.read() => match inbound {
                    Ok(Some(Message::Response(response))) if pending_pings.contains(&response.id) => {
                        tracing::debug!("Ping reply {} from {}", response.id, remote);
                        pending_pings.clear();
                    }
                    Ok(Some(message)) => {
                        if !self.forward(self.upstream.as_ref(), message).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("{} closed its channel", remote);
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!("Channel from {} failed: {}", remote, e);
                        break;
                    }
                    Err(e) => tracing::warn!("Dropping message from {}: {}", remote, e),
                },
                outbound = self.upstream.read() => match outbound {
                    Ok(Some(message)) => {
                        if !self.forward(self.peer.as_ref(), message).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("End of MCP stream for {}", remote);
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!("MCP server stream for {} failed: {}", remote, e);
                        break;
                    }
                    Err(e) => tracing::warn!("Dropping message for {}: {}", remote, e),
                },
            }
        }

        let _ = self.upstream.close().await;
        let _ = self.peer.close().await;
        tracing::info!("Bridge for {} ended", remote);
    }

    /// Relay one message; false when the bridge must stop
    async fn forward(&self, to: &dyn Transport, message: Message) -> bool {
        tracing::debug!("Forwarding {} to {}", message.kind(), to.peer());
        match to.write(message).await {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                tracing::error!("Forwarding to {} failed: {}", to.peer(), e);
                false
            }
            Err(e) => {
                tracing::warn!("Could not forward to {}: {}", to.peer(), e);
                true
            }
        }
    }
}
