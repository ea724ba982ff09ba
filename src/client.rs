//! Typed MCP client over a session

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use crate::mcp::{
    methods, GetPromptResult, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, Notification, Prompt, ReadResourceResult, Resource, Tool, ToolCallResult,
    PROTOCOL_VERSION,
};
use crate::session::{Session, DEFAULT_NOTIFICATION_CAPACITY};
use crate::transport::Transport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct McpClient {
    session: Session,
    timeout: Duration,
    notifications: Mutex<Option<mpsc::Receiver<Notification>>>,
}

impl McpClient {
    /// Start a client session over `transport`
    pub fn connect(transport: Arc<dyn Transport>) -> Self {
        let session = Session::client(transport);
        let notifications = session.subscribe_notifications(DEFAULT_NOTIFICATION_CAPACITY);
        session.start();
        Self {
            session,
            timeout: DEFAULT_TIMEOUT,
            notifications: Mutex::new(Some(notifications)),
        }
    }

    /// Per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Take the stream of server notifications; `None` after the first call
    pub fn notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.lock().take()
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self
            .session
            .send_request(method, params)
            .await?
            .wait_timeout(self.timeout)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RelayError::Protocol(format!("bad {} result: {}", method, e)))
    }

    /// Handshake: `initialize` then `notifications/initialized`
    pub async fn initialize(&self, client_name: &str) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .call(
                methods::INITIALIZE,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": client_name,
                        "version": crate::VERSION,
                    },
                }),
            )
            .await?;
        self.session
            .send_notification(methods::INITIALIZED, json!({}))
            .await?;
        tracing::info!(
            "Initialized with {} {}",
            result.server_info.name,
            result.server_info.version
        );
        Ok(result)
    }

    pub async fn ping(&self) -> Result<()> {
        self.call::<Value>(methods::PING, json!({})).await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result: ListToolsResult = self.call(methods::LIST_TOOLS, json!({})).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<ToolCallResult> {
        self.call(
            methods::CALL_TOOL,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        let result: ListResourcesResult = self.call(methods::LIST_RESOURCES, json!({})).await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.call(methods::READ_RESOURCE, json!({ "uri": uri })).await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        self.call::<Value>(methods::SUBSCRIBE_RESOURCE, json!({ "uri": uri }))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.call::<Value>(methods::UNSUBSCRIBE_RESOURCE, json!({ "uri": uri }))
            .await?;
        Ok(())
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let result: ListPromptsResult = self.call(methods::LIST_PROMPTS, json!({})).await?;
        Ok(result.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        self.call(
            methods::GET_PROMPT,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::sample::{sample_server, StaticFetcher};
    use crate::server::SessionManager;
    use crate::transport::MemoryTransport;

    fn connect() -> (McpClient, SessionManager) {
        let server = sample_server(Arc::new(StaticFetcher::new("page"))).unwrap();
        let manager = SessionManager::new(Arc::new(server));
        let (a, b) = MemoryTransport::pair();
        manager.open(Arc::new(b));
        (McpClient::connect(Arc::new(a)), manager)
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let (client, _manager) = connect();
        let init = client.initialize("test-client").await.unwrap();
        assert_eq!(init.protocol_version, PROTOCOL_VERSION);
        assert!(init.capabilities.resources.unwrap().subscribe);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "fetch");
        assert_eq!(client.list_resources().await.unwrap().len(), 3);
        assert_eq!(client.list_prompts().await.unwrap()[0].name, "simple");
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_emits_related_log() {
        let (client, _manager) = connect();
        let mut notes = client.notifications().unwrap();
        assert!(client.notifications().is_none());

        let read = client.read_resource("file:///help.txt").await.unwrap();
        assert_eq!(
            read.contents[0].text.as_deref(),
            Some("This server provides a few sample text resources for testing.")
        );
        let note = notes.try_recv().unwrap();
        assert_eq!(note.params["logger"], "read_resource_stream");
        assert_eq!(note.params["data"], "client read resource file:///help.txt");
        assert!(note.related_request_id.is_some());
    }

    #[tokio::test]
    async fn test_errors_map_to_remote() {
        let (client, _manager) = connect();
        let err = client.call_tool("nope", Map::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Remote { code: -32601, .. }));

        let err = client.call_tool("fetch", Map::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Remote { code: -32602, .. }));

        let err = client.read_resource("file:///nope.txt").await.unwrap_err();
        assert!(matches!(err, RelayError::Remote { code: -32002, .. }));
    }
}
