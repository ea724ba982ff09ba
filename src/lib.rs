//! mcp-relay - MCP session core over streamable HTTP and pub/sub channels
//!
//! One [`Session`] implementation correlates requests, dispatches handlers
//! and delivers notifications over any [`Transport`]: the server half of
//! streamable HTTP, its client half, a pub/sub [`Fabric`] channel, or an
//! in-memory pair. On top sit the [`McpServer`] with its capability and
//! subscription registries, a typed [`McpClient`], and the channel-to-HTTP
//! [`Proxy`].

pub mod client;
pub mod config;
pub mod error;
pub mod fabric;
pub mod logging;
pub mod mcp;
pub mod proxy;
pub mod server;
pub mod session;
pub mod transport;

pub use client::McpClient;
pub use config::{JsonNotificationPolicy, LogLevel, ProxyConfig, ServerConfig};
pub use error::{RelayError, Result};
pub use fabric::{AgentName, Fabric, LocalFabric};
pub use proxy::Proxy;
pub use server::{McpServer, SessionManager};
pub use session::{RequestContext, RequestHandler, Session, SessionState};
pub use transport::Transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
