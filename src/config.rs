//! Runtime configuration for the server and the proxy

use std::time::Duration;

use clap::ValueEnum;

use crate::error::{RelayError, Result};
use crate::fabric::AgentName;

/// Log verbosity accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// What JSON-only mode does with notifications raised while a request runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum JsonNotificationPolicy {
    /// Drop them
    #[default]
    Suppress,
    /// Return them in a JSON array ahead of the response
    Flush,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: LogLevel,
    /// Answer POSTs with one JSON body instead of an SSE stream
    pub json_response: bool,
    pub json_notifications: JsonNotificationPolicy,
    /// Close HTTP sessions with no open stream and no traffic for this long
    pub session_idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            log_level: LogLevel::default(),
            json_response: false,
            json_notifications: JsonNotificationPolicy::default(),
            session_idle_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(RelayError::Config("port must be non-zero".into()));
        }
        if self.host.trim().is_empty() {
            return Err(RelayError::Config("host must not be empty".into()));
        }
        if self.session_idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RelayError::Config(
                "session idle timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Name the proxy subscribes under
    pub local: AgentName,
    /// Streamable HTTP endpoint of the upstream MCP server
    pub server_url: String,
    pub ping_interval: Duration,
    /// Outstanding pings after which a peer is considered gone
    pub max_pending_pings: usize,
}

impl ProxyConfig {
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
    pub const DEFAULT_MAX_PENDING_PINGS: usize = 3;

    pub fn new(local: AgentName, server_url: impl Into<String>) -> Self {
        Self {
            local,
            server_url: server_url.into(),
            ping_interval: Self::DEFAULT_PING_INTERVAL,
            max_pending_pings: Self::DEFAULT_MAX_PENDING_PINGS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_interval.is_zero() {
            return Err(RelayError::Config("ping interval must be non-zero".into()));
        }
        if self.max_pending_pings == 0 {
            return Err(RelayError::Config(
                "max pending pings must be at least 1".into(),
            ));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(RelayError::Config(format!(
                "server url '{}' is not http(s)",
                self.server_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "127.0.0.1:8000");
        assert_eq!(config.json_notifications, JsonNotificationPolicy::Suppress);

        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));

        let config = ServerConfig {
            session_idle_timeout: Some(Duration::ZERO),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_proxy_validation() {
        let local = AgentName::new("org", "mcp", "proxy");
        let config = ProxyConfig::new(local.clone(), "http://localhost:8000/mcp");
        assert!(config.validate().is_ok());
        assert_eq!(config.ping_interval, Duration::from_secs(20));

        let config = ProxyConfig {
            max_pending_pings: 0,
            ..ProxyConfig::new(local.clone(), "http://localhost:8000/mcp")
        };
        assert!(config.validate().is_err());
        assert!(ProxyConfig::new(local, "localhost:8000").validate().is_err());
    }

    #[test]
    fn test_log_directive() {
        assert_eq!(LogLevel::Warning.as_directive(), "warn");
        assert_eq!(LogLevel::default().as_directive(), "debug");
    }
}
