//! mcp-relay sample server over streamable HTTP
//!
//! Run with: mcp-relay-server --port 8000

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use mcp_relay::config::{JsonNotificationPolicy, LogLevel, ServerConfig};
use mcp_relay::server::http;
use mcp_relay::server::sample::{sample_server, HttpFetcher};
use mcp_relay::SessionManager;

#[derive(Parser, Debug)]
#[command(name = "mcp-relay-server")]
#[command(about = "Sample MCP server over streamable HTTP", version)]
struct Args {
    /// Address to bind
    #[arg(long, env = "MCP_RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on for HTTP
    #[arg(long, env = "MCP_RELAY_PORT", default_value = "8000")]
    port: u16,

    /// Logging level
    #[arg(long, env = "MCP_RELAY_LOG_LEVEL", value_enum, default_value = "debug")]
    log_level: LogLevel,

    /// Enable JSON responses instead of SSE streams
    #[arg(long, env = "MCP_RELAY_JSON_RESPONSE")]
    json_response: bool,

    /// Notifications raised during a request in JSON mode: suppress or flush
    #[arg(
        long,
        env = "MCP_RELAY_JSON_NOTIFICATIONS",
        value_enum,
        default_value = "suppress"
    )]
    json_notifications: JsonNotificationPolicy,

    /// Seconds an HTTP session may sit without streams or traffic before it is closed
    #[arg(long, env = "MCP_RELAY_SESSION_IDLE_TIMEOUT")]
    session_idle_timeout: Option<u64>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            log_level: args.log_level,
            json_response: args.json_response,
            json_notifications: args.json_notifications,
            session_idle_timeout: args.session_idle_timeout.map(Duration::from_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from(Args::parse());
    mcp_relay::logging::init(config.log_level);
    config.validate()?;

    let server = sample_server(Arc::new(HttpFetcher::new()?))?;
    let manager = SessionManager::new(Arc::new(server));

    tracing::info!(
        "Starting mcp-relay-server {} (json_response={})",
        mcp_relay::VERSION,
        config.json_response
    );
    http::serve(config, manager).await?;
    tracing::info!("Server stopped");
    Ok(())
}
