//! Streamable HTTP integration tests against a live axum server
//!
//! Run with: cargo test --test http_transport

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mcp_relay::config::{JsonNotificationPolicy, ServerConfig};
use mcp_relay::mcp::{methods, Content, Notification};
use mcp_relay::server::http::{self, HttpState, MCP_PATH};
use mcp_relay::server::sample::{sample_server, PageFetcher, StaticFetcher};
use mcp_relay::transport::{HttpClientOptions, HttpClientTransport, SESSION_HEADER};
use mcp_relay::{McpClient, SessionManager};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const GREETING: &str = "file:///greeting.txt";

struct TestServer {
    url: String,
    manager: SessionManager,
    state: HttpState,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<mcp_relay::Result<()>>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        Self::start_with(config, Arc::new(StaticFetcher::new("<html>fetched</html>"))).await
    }

    async fn start_with(config: ServerConfig, fetcher: Arc<dyn PageFetcher>) -> Self {
        let server = sample_server(fetcher).unwrap();
        let manager = SessionManager::new(Arc::new(server));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = HttpState::new(config, manager.clone());
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(http::serve_with_shutdown(listener, state.clone(), async {
            let _ = stopped.await;
        }));
        Self {
            url: format!("http://{}{}", addr, MCP_PATH),
            manager,
            state,
            stop: Some(stop),
            task: Some(task),
        }
    }

    fn client(&self, open_event_stream: bool) -> McpClient {
        let options = HttpClientOptions {
            open_event_stream,
            ..HttpClientOptions::default()
        };
        let transport = HttpClientTransport::with_options(self.url.clone(), options).unwrap();
        McpClient::connect(Arc::new(transport)).with_timeout(Duration::from_secs(5))
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("server should drain")
                .unwrap()
                .unwrap();
        }
    }
}

/// Holds every fetch for a fixed delay
struct SlowFetcher(Duration);

#[async_trait]
impl PageFetcher for SlowFetcher {
    async fn fetch(&self, _url: &str) -> mcp_relay::Result<String> {
        tokio::time::sleep(self.0).await;
        Ok("<html>slow</html>".into())
    }
}

fn json_config(policy: JsonNotificationPolicy) -> ServerConfig {
    ServerConfig {
        json_response: true,
        json_notifications: policy,
        ..ServerConfig::default()
    }
}

async fn next_matching(
    notifications: &mut mpsc::Receiver<Notification>,
    method: &str,
) -> Option<Notification> {
    tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(n) = notifications.recv().await {
            if n.method == method {
                return Some(n);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

// ============================================================================
// SSE MODE
// ============================================================================

#[tokio::test]
async fn test_full_walkthrough_over_sse() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client(false);

    let init = client.initialize("http-tests").await.unwrap();
    assert_eq!(init.server_info.name, "mcp-relay-server");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "fetch");

    let mut arguments = Map::new();
    arguments.insert("url".into(), json!("https://example.com"));
    let fetched = client.call_tool("fetch", arguments).await.unwrap();
    assert_eq!(fetched.first_text(), Some("<html>fetched</html>"));

    let resources = client.list_resources().await.unwrap();
    assert_eq!(resources.len(), 3);

    let read = client.read_resource(GREETING).await.unwrap();
    assert_eq!(
        read.contents[0].text.as_deref(),
        Some("Hello! This is a sample text resource.")
    );

    let prompts = client.list_prompts().await.unwrap();
    assert_eq!(prompts[0].name, "simple");

    client.ping().await.unwrap();
    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_related_log_arrives_before_response() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client(false);
    let mut notifications = client.notifications().unwrap();
    client.initialize("http-tests").await.unwrap();

    client.subscribe_resource(GREETING).await.unwrap();

    // The log rode the same SSE stream ahead of the response, so it is queued
    let log = notifications.try_recv().unwrap();
    assert_eq!(log.method, methods::LOG_MESSAGE);
    assert_eq!(log.params["data"], json!("subscribe_resource"));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_update_reaches_client_over_standalone_stream() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client(true);
    let mut notifications = client.notifications().unwrap();
    client.initialize("http-tests").await.unwrap();
    client.subscribe_resource(GREETING).await.unwrap();

    let notified = server
        .manager
        .server()
        .update_resource(GREETING, Content::Text("fresh".into()))
        .await
        .unwrap();
    assert_eq!(notified, 1);

    let updated = next_matching(&mut notifications, methods::RESOURCE_UPDATED)
        .await
        .expect("update notification");
    assert_eq!(updated.params["uri"], json!(GREETING));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_delete_ends_the_session() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client(false);
    client.initialize("http-tests").await.unwrap();
    assert_eq!(server.state.session_count(), 1);

    client.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.state.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(server.manager.is_empty());
    server.stop().await;
}

// ============================================================================
// JSON MODE
// ============================================================================

#[tokio::test]
async fn test_json_mode_walkthrough() {
    let server = TestServer::start(json_config(JsonNotificationPolicy::Suppress)).await;
    let client = server.client(false);
    let mut notifications = client.notifications().unwrap();

    client.initialize("http-tests").await.unwrap();
    client.subscribe_resource(GREETING).await.unwrap();
    let read = client.read_resource(GREETING).await.unwrap();
    assert_eq!(read.contents.len(), 1);

    // Suppressed: the log notifications never reach the client
    assert!(notifications.try_recv().is_err());

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_json_mode_flush_delivers_logs() {
    let server = TestServer::start(json_config(JsonNotificationPolicy::Flush)).await;
    let client = server.client(false);
    let mut notifications = client.notifications().unwrap();

    client.initialize("http-tests").await.unwrap();
    client.subscribe_resource(GREETING).await.unwrap();

    let log = next_matching(&mut notifications, methods::LOG_MESSAGE)
        .await
        .expect("flushed log");
    assert_eq!(log.params["data"], json!("subscribe_resource"));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_json_mode_slow_tool_does_not_block_other_requests() {
    let server = TestServer::start_with(
        json_config(JsonNotificationPolicy::Suppress),
        Arc::new(SlowFetcher(Duration::from_millis(800))),
    )
    .await;
    let client = server.client(false);
    client.initialize("http-tests").await.unwrap();

    let started = Instant::now();
    let slow = client
        .session()
        .send_request(
            methods::CALL_TOOL,
            json!({"name": "fetch", "arguments": {"url": "https://example.com"}}),
        )
        .await
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "send_request waited {:?} for the reply",
        started.elapsed()
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let ping_started = Instant::now();
    client.ping().await.unwrap();
    let latency = ping_started.elapsed();
    assert!(
        latency < Duration::from_millis(400),
        "ping took {:?} behind the slow call",
        latency
    );

    let result = slow.wait_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(result["content"][0]["text"], json!("<html>slow</html>"));

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_idle_session_is_closed_without_delete() {
    let config = ServerConfig {
        session_idle_timeout: Some(Duration::from_millis(100)),
        ..json_config(JsonNotificationPolicy::Suppress)
    };
    let server = TestServer::start(config).await;
    let client = server.client(false);
    client.initialize("http-tests").await.unwrap();
    assert_eq!(server.manager.len(), 1);

    tokio::time::timeout(Duration::from_secs(3), async {
        while server.state.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("idle session should be reaped");
    assert!(server.manager.is_empty());

    server.stop().await;
}

// ============================================================================
// RAW HTTP
// ============================================================================

#[tokio::test]
async fn test_raw_post_without_session_is_rejected() {
    let server = TestServer::start(ServerConfig::default()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(&server.url)
        .header("content-type", "application/json")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = http
        .post(&server.url)
        .header(SESSION_HEADER, "no-such-session")
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_raw_json_initialize_assigns_session() {
    let server = TestServer::start(json_config(JsonNotificationPolicy::Suppress)).await;
    let http = reqwest::Client::new();

    let response = http
        .post(&server.url)
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .body(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("session header");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], json!(1));
    assert_eq!(body["result"]["serverInfo"]["name"], json!("mcp-relay-server"));

    let response = http
        .post(&server.url)
        .header(SESSION_HEADER, &session_id)
        .body(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let response = http
        .delete(&server.url)
        .header(SESSION_HEADER, &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    server.stop().await;
}
