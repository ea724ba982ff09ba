//! Error types for mcp-relay

use thiserror::Error;

use crate::mcp::RequestId;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for mcp-relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Unknown {kind}: {name}")]
    UnknownCapability { kind: &'static str, name: String },

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Missing required argument '{0}'")]
    MissingArgument(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Duplicate {kind}: {name}")]
    DuplicateCapability { kind: &'static str, name: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request id {0} is already in flight")]
    DuplicateRequest(RequestId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Request timed out")]
    Timeout,

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Invalid agent name '{0}': expected organization/namespace/agent")]
    InvalidAgentName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Check if the error must tear down the session it occurred on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(_) | RelayError::Io(_) | RelayError::SessionClosed
        )
    }

    /// Get error code for the JSON-RPC error object
    pub fn code(&self) -> i64 {
        match self {
            RelayError::UnknownCapability { .. } | RelayError::MethodNotFound(_) => -32601,
            RelayError::MissingArgument(_) | RelayError::InvalidParams(_) => -32602,
            RelayError::UnknownResource(_) => -32002,
            RelayError::Protocol(_) | RelayError::Serialization(_) => -32700,
            RelayError::DuplicateRequest(_) => -32600,
            RelayError::SessionClosed => -32000,
            RelayError::Remote { code, .. } => *code,
            _ => -32603,
        }
    }

    pub(crate) fn unknown_tool(name: impl Into<String>) -> Self {
        RelayError::UnknownCapability {
            kind: "tool",
            name: name.into(),
        }
    }

    pub(crate) fn unknown_prompt(name: impl Into<String>) -> Self {
        RelayError::UnknownCapability {
            kind: "prompt",
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(RelayError::unknown_tool("nope").code(), -32601);
        assert_eq!(RelayError::MissingArgument("url".into()).code(), -32602);
        assert_eq!(RelayError::UnknownResource("x".into()).code(), -32002);
        assert_eq!(RelayError::DuplicateRequest(RequestId::Number(1)).code(), -32600);
        assert_eq!(
            RelayError::Remote {
                code: -32099,
                message: "boom".into()
            }
            .code(),
            -32099
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RelayError::Transport("reset".into()).is_fatal());
        assert!(!RelayError::Protocol("unexpected response id 7".into()).is_fatal());
        assert!(!RelayError::unknown_prompt("x").is_fatal());
        assert!(!RelayError::DuplicateRequest(RequestId::Number(1)).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RelayError::unknown_tool("nope");
        assert_eq!(err.to_string(), "Unknown tool: nope");
        let err = RelayError::MissingArgument("url".into());
        assert!(err.to_string().contains("'url'"));
    }
}
