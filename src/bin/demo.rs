//! mcp-relay end-to-end walkthrough
//!
//! Starts the sample HTTP server, an in-process fabric with the proxy
//! attached, and a channel client that exercises every standard method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Map};
use tokio::net::TcpListener;

use mcp_relay::config::{LogLevel, ProxyConfig, ServerConfig};
use mcp_relay::mcp::{methods, Content, LoggingMessageParams};
use mcp_relay::server::http::{self, HttpState};
use mcp_relay::server::sample::{sample_server, HttpFetcher, PageFetcher, StaticFetcher};
use mcp_relay::transport::ChannelTransport;
use mcp_relay::{AgentName, Fabric, LocalFabric, McpClient, Proxy, SessionManager};

#[derive(Parser, Debug)]
#[command(name = "mcp-relay-demo")]
#[command(about = "Run server, proxy and channel client in one process", version)]
struct Args {
    /// Logging level
    #[arg(long, env = "MCP_RELAY_LOG_LEVEL", value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Port for the HTTP server (0 picks a free one)
    #[arg(long, env = "MCP_RELAY_PORT", default_value = "0")]
    port: u16,

    /// Proxy name in the form org/ns/agent
    #[arg(long, default_value = "org/mcp/proxy")]
    proxy_name: AgentName,

    /// Client name in the form org/ns/agent
    #[arg(long, default_value = "org/mcp/client1")]
    client_name: AgentName,

    /// URL passed to the fetch tool
    #[arg(long, default_value = "https://example.com")]
    fetch_url: String,

    /// Serve a canned page instead of fetching over the network
    #[arg(long)]
    offline: bool,
}

const GREETING: &str = "file:///greeting.txt";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    mcp_relay::logging::init(args.log_level);

    let fetcher: Arc<dyn PageFetcher> = if args.offline {
        Arc::new(StaticFetcher::new("<html><body>offline</body></html>"))
    } else {
        Arc::new(HttpFetcher::new()?)
    };
    let server = Arc::new(sample_server(fetcher)?);
    let manager = SessionManager::new(server.clone());

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let addr = listener.local_addr()?;
    let (stop_server, server_stopped) = tokio::sync::oneshot::channel::<()>();
    let state = HttpState::new(ServerConfig::default(), manager.clone());
    let http_task = tokio::spawn(http::serve_with_shutdown(listener, state, async {
        let _ = server_stopped.await;
    }));

    let fabric = LocalFabric::new();
    let proxy_config = ProxyConfig::new(args.proxy_name.clone(), format!("http://{}/mcp", addr));
    let (stop_proxy, proxy_stopped) = tokio::sync::oneshot::channel::<()>();
    let proxy = Proxy::new(proxy_config, Arc::new(fabric.clone()));
    let proxy_task = tokio::spawn(proxy.run(async {
        let _ = proxy_stopped.await;
    }));

    wait_for_subscription(&fabric, &args.proxy_name).await?;

    let shared: Arc<dyn Fabric> = Arc::new(fabric.clone());
    let transport = ChannelTransport::connect(shared, args.client_name.clone(), args.proxy_name.clone())
        .await?;
    let client = McpClient::connect(Arc::new(transport));

    let subscribed = Arc::new(AtomicBool::new(false));
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let mut notifications = client
        .notifications()
        .context("notification stream already taken")?;
    {
        let subscribed = subscribed.clone();
        let unsubscribed = unsubscribed.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                if notification.method == methods::LOG_MESSAGE {
                    if let Ok(params) = serde_json::from_value::<LoggingMessageParams>(notification.params) {
                        tracing::info!("Received server log notification {:?}", params);
                        match params.data.as_str() {
                            Some("subscribe_resource") => subscribed.store(true, Ordering::SeqCst),
                            Some("unsubscribe_resource") => unsubscribed.store(true, Ordering::SeqCst),
                            _ => {}
                        }
                    }
                } else {
                    tracing::info!("Received notification {} {}", notification.method, notification.params);
                }
            }
        });
    }

    let result = walkthrough(&client, &server, &args.fetch_url, &subscribed, &unsubscribed).await;

    client.close().await?;
    let _ = stop_proxy.send(());
    proxy_task.await??;
    let _ = stop_server.send(());
    http_task.await??;

    result
}

async fn walkthrough(
    client: &McpClient,
    server: &mcp_relay::McpServer,
    fetch_url: &str,
    subscribed: &AtomicBool,
    unsubscribed: &AtomicBool,
) -> anyhow::Result<()> {
    tracing::info!("initialize session");
    client.initialize("mcp-relay-demo").await?;

    let tools = client.list_tools().await?;
    tracing::info!("Successfully retrieved tools: {:?}", tools);

    let mut arguments = Map::new();
    arguments.insert("url".to_string(), json!(fetch_url));
    match client.call_tool("fetch", arguments).await {
        Ok(result) => {
            let text = result.first_text().unwrap_or_default();
            tracing::info!("Successfully used tool: {} bytes", text.len());
        }
        Err(e) => tracing::warn!("Fetch tool failed: {}", e),
    }

    let resources = client.list_resources().await?;
    tracing::info!("Successfully list resources: {:?}", resources);

    client.subscribe_resource(GREETING).await?;
    wait_for_flag(subscribed, "subscription").await?;
    tracing::info!("Successfully processed subscription");

    let notified = server
        .update_resource(GREETING, Content::Text("Hello again! The greeting changed.".into()))
        .await?;
    tracing::info!("Resource change sent to {} subscriber(s)", notified);

    let resource = client.read_resource(GREETING).await?;
    tracing::info!("Successfully used resource: {:?}", resource);

    client.unsubscribe_resource(GREETING).await?;
    wait_for_flag(unsubscribed, "unsubscription").await?;
    tracing::info!("Successfully processed unsubscription");

    let prompts = client.list_prompts().await?;
    tracing::info!("Successfully list prompts: {:?}", prompts);

    let mut prompt_args = HashMap::new();
    prompt_args.insert("context".to_string(), "User is a software developer".to_string());
    prompt_args.insert("topic".to_string(), "Rust async programming".to_string());
    let prompt = client.get_prompt("simple", prompt_args).await?;
    tracing::info!("Successfully got prompt: {:?}", prompt);
    Ok(())
}

async fn wait_for_subscription(fabric: &LocalFabric, name: &AgentName) -> anyhow::Result<()> {
    for _ in 0..200 {
        if fabric.is_subscribed(name) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("proxy {} never subscribed", name)
}

async fn wait_for_flag(flag: &AtomicBool, what: &str) -> anyhow::Result<()> {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("no log notification for {}", what)
}
