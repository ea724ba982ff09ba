//! MCP server: standard methods over the capability and subscription registries

pub mod http;
pub mod manager;
pub mod registry;
pub mod sample;
pub mod subscriptions;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{RelayError, Result};
use crate::mcp::{
    methods, CallToolParams, Content, GetPromptParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, LoggingLevel, Notification, Request, ResourceUriParams,
    ServerInfo,
};
use crate::session::{RequestContext, RequestHandler};

pub use manager::SessionManager;
pub use registry::{
    CapabilityKind, CapabilityRegistry, CapabilityRegistryBuilder, PromptHandler, ToolHandler,
};
pub use subscriptions::{NotificationSink, SubscriptionRegistry};

const READ_LOGGER: &str = "read_resource_stream";
const SUBSCRIBE_LOGGER: &str = "subscribe_resource_stream";
const UNSUBSCRIBE_LOGGER: &str = "unsubscribe_resource_stream";

/// Request handler shared by every server session
pub struct McpServer {
    info: ServerInfo,
    registry: CapabilityRegistry,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl McpServer {
    pub fn new(info: ServerInfo, registry: CapabilityRegistry) -> Self {
        Self {
            info,
            registry,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Replace a resource's content and notify its subscribers
    ///
    /// Returns the number of sessions notified.
    pub async fn update_resource(&self, uri: &str, content: Content) -> Result<usize> {
        let canonical = self.registry.update_resource(uri, content)?.to_string();
        tracing::info!("Resource {} updated", canonical);
        let notification = Notification::new(
            methods::RESOURCE_UPDATED,
            serde_json::to_value(ResourceUriParams {
                uri: canonical.clone(),
            })?,
        );
        Ok(self
            .subscriptions
            .notify_change(&canonical, notification)
            .await)
    }

    /// Canonical identifier of a registered resource
    fn canonical_uri(&self, uri: &str) -> Result<String> {
        self.registry
            .resolve(uri)
            .map(|r| r.uri.clone())
            .ok_or_else(|| RelayError::UnknownResource(uri.to_string()))
    }

    async fn log(&self, ctx: &RequestContext, logger: &str, data: Value) {
        if let Err(e) = ctx.send_log(LoggingLevel::Info, logger, data).await {
            tracing::debug!("Could not send log notification: {}", e);
        }
    }

    async fn read_resource(&self, ctx: &RequestContext, params: ResourceUriParams) -> Result<Value> {
        let result = self.registry.read(&params.uri)?;
        self.log(ctx, READ_LOGGER, json!(format!("client read resource {}", params.uri)))
            .await;
        Ok(serde_json::to_value(result)?)
    }

    async fn subscribe(&self, ctx: &RequestContext, params: ResourceUriParams) -> Result<Value> {
        let uri = self.canonical_uri(&params.uri)?;
        self.log(ctx, SUBSCRIBE_LOGGER, json!("subscribe_resource"))
            .await;
        self.subscriptions.subscribe(ctx.session_id(), &uri);
        tracing::debug!("Session {} subscribed to {}", ctx.session_id(), uri);
        Ok(json!({}))
    }

    async fn unsubscribe(&self, ctx: &RequestContext, params: ResourceUriParams) -> Result<Value> {
        let uri = self.canonical_uri(&params.uri)?;
        self.log(ctx, UNSUBSCRIBE_LOGGER, json!("unsubscribe_resource"))
            .await;
        self.subscriptions.unsubscribe(ctx.session_id(), &uri);
        Ok(json!({}))
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| RelayError::InvalidParams(e.to_string()))
}

#[async_trait]
impl RequestHandler for McpServer {
    async fn handle(&self, ctx: RequestContext, request: Request) -> Result<Value> {
        tracing::debug!(
            "Session {} request {} {}",
            ctx.session_id(),
            request.id,
            request.method
        );
        match request.method.as_str() {
            methods::INITIALIZE => Ok(serde_json::to_value(InitializeResult::new(
                self.info.clone(),
            ))?),
            methods::PING => Ok(json!({})),
            methods::LIST_TOOLS => Ok(serde_json::to_value(ListToolsResult {
                tools: self.registry.tools().into_iter().cloned().collect(),
            })?),
            methods::CALL_TOOL => {
                let params: CallToolParams = parse_params(request.params)?;
                let result = self
                    .registry
                    .call_tool(&ctx, &params.name, params.arguments)
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
            methods::LIST_RESOURCES => Ok(serde_json::to_value(ListResourcesResult {
                resources: self.registry.resources().into_iter().cloned().collect(),
            })?),
            methods::READ_RESOURCE => self.read_resource(&ctx, parse_params(request.params)?).await,
            methods::SUBSCRIBE_RESOURCE => {
                self.subscribe(&ctx, parse_params(request.params)?).await
            }
            methods::UNSUBSCRIBE_RESOURCE => {
                self.unsubscribe(&ctx, parse_params(request.params)?).await
            }
            methods::LIST_PROMPTS => Ok(serde_json::to_value(ListPromptsResult {
                prompts: self.registry.prompts().into_iter().cloned().collect(),
            })?),
            methods::GET_PROMPT => {
                let params: GetPromptParams = parse_params(request.params)?;
                let result = self
                    .registry
                    .get_prompt(&ctx, &params.name, params.arguments.unwrap_or_default())
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
            other => Err(RelayError::MethodNotFound(other.to_string())),
        }
    }
}
