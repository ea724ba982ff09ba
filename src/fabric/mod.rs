//! Pub/sub fabric capability consumed by the channel transport
//!
//! The network stack itself (connections, routing tables, TLS) lives
//! behind [`Fabric`]. [`LocalFabric`] is an in-process implementation.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

mod local;

pub use local::LocalFabric;

/// Three-part pub/sub address: organization/namespace/agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentName {
    pub organization: String,
    pub namespace: String,
    pub agent: String,
}

impl AgentName {
    pub fn new(
        organization: impl Into<String>,
        namespace: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            namespace: namespace.into(),
            agent: agent.into(),
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.namespace, self.agent)
    }
}

impl FromStr for AgentName {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [org, ns, agent] if !org.is_empty() && !ns.is_empty() && !agent.is_empty() => {
                Ok(AgentName::new(*org, *ns, *agent))
            }
            _ => Err(RelayError::InvalidAgentName(s.to_string())),
        }
    }
}

/// A payload received from the fabric
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: AgentName,
    pub payload: Vec<u8>,
}

/// Addressed publish/subscribe network
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Subscribe `local` and return its inbox
    async fn subscribe(&self, local: &AgentName) -> Result<mpsc::Receiver<Envelope>>;

    async fn unsubscribe(&self, local: &AgentName) -> Result<()>;

    /// Establish a route from `local` to `remote`; required before first publish
    async fn set_route(&self, local: &AgentName, remote: &AgentName) -> Result<()>;

    async fn publish(
        &self,
        source: &AgentName,
        destination: &AgentName,
        payload: Vec<u8>,
    ) -> Result<()>;
}
