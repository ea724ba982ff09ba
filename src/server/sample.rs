//! Sample catalogue: a `fetch` tool, three text resources and a `simple` prompt

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::registry::{CapabilityRegistry, PromptHandler, ToolHandler};
use super::McpServer;
use crate::error::{RelayError, Result};
use crate::mcp::{
    GetPromptResult, Prompt, PromptArgument, PromptMessage, Resource, ServerInfo, Tool,
    ToolCallResult,
};
use crate::session::RequestContext;

const USER_AGENT: &str = "mcp-relay fetch tool";

/// Name and text of each sample resource, served as `file:///<name>.txt`
pub const SAMPLE_RESOURCES: [(&str, &str); 3] = [
    ("greeting", "Hello! This is a sample text resource."),
    (
        "help",
        "This server provides a few sample text resources for testing.",
    ),
    (
        "about",
        "This is the simple-resource MCP server implementation.",
    ),
];

/// Retrieves a page body for the `fetch` tool
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetches over HTTP, following redirects
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Returns the same body for every URL
pub struct StaticFetcher {
    body: String,
}

impl StaticFetcher {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<String> {
        Ok(self.body.clone())
    }
}

pub struct FetchTool {
    fetcher: Arc<dyn PageFetcher>,
}

impl FetchTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn descriptor() -> Tool {
        Tool {
            name: "fetch".to_string(),
            description: "Fetches a website and returns its content".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL to fetch"
                    }
                }
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for FetchTool {
    async fn call(
        &self,
        _ctx: &RequestContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallResult> {
        let url = arguments
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::InvalidParams("url must be a string".into()))?;
        let body = self.fetcher.fetch(url).await?;
        Ok(ToolCallResult::text(body))
    }
}

pub struct SimplePrompt;

impl SimplePrompt {
    pub fn descriptor() -> Prompt {
        Prompt {
            name: "simple".to_string(),
            description: Some(
                "A simple prompt that can take optional context and topic arguments".to_string(),
            ),
            arguments: vec![
                PromptArgument {
                    name: "context".to_string(),
                    description: Some("Additional context to consider".to_string()),
                    required: false,
                },
                PromptArgument {
                    name: "topic".to_string(),
                    description: Some("Specific topic to focus on".to_string()),
                    required: false,
                },
            ],
        }
    }

    pub fn create_messages(context: Option<&str>, topic: Option<&str>) -> Vec<PromptMessage> {
        let mut messages = Vec::new();
        if let Some(context) = context.filter(|c| !c.is_empty()) {
            messages.push(PromptMessage::user_text(format!(
                "Here is some relevant context: {}",
                context
            )));
        }
        let prompt = match topic.filter(|t| !t.is_empty()) {
            Some(topic) => format!("Please help me with the following topic: {}", topic),
            None => "Please help me with whatever questions I may have.".to_string(),
        };
        messages.push(PromptMessage::user_text(prompt));
        messages
    }
}

#[async_trait]
impl PromptHandler for SimplePrompt {
    async fn get(
        &self,
        _ctx: &RequestContext,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        Ok(GetPromptResult {
            description: Some(
                "A simple prompt with optional context and topic arguments".to_string(),
            ),
            messages: Self::create_messages(
                arguments.get("context").map(String::as_str),
                arguments.get("topic").map(String::as_str),
            ),
        })
    }
}

fn sample_resource(name: &str) -> Resource {
    Resource {
        uri: format!("file:///{}.txt", name),
        name: name.to_string(),
        description: Some(format!("A sample text resource named {}", name)),
        mime_type: Some("text/plain".to_string()),
    }
}

pub fn sample_registry(fetcher: Arc<dyn PageFetcher>) -> Result<CapabilityRegistry> {
    let mut builder = CapabilityRegistry::builder()
        .tool(FetchTool::descriptor(), Arc::new(FetchTool::new(fetcher)))?;
    for (name, text) in SAMPLE_RESOURCES {
        builder = builder.resource(sample_resource(name), text)?;
    }
    Ok(builder
        .prompt(SimplePrompt::descriptor(), Arc::new(SimplePrompt))?
        .build())
}

/// Server over the sample catalogue
pub fn sample_server(fetcher: Arc<dyn PageFetcher>) -> Result<McpServer> {
    let info = ServerInfo {
        name: "mcp-relay-server".to_string(),
        version: crate::VERSION.to_string(),
    };
    Ok(McpServer::new(info, sample_registry(fetcher)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::transport::MemoryTransport;
    use pretty_assertions::assert_eq;

    fn ctx() -> RequestContext {
        let (a, _b) = MemoryTransport::pair();
        Session::client(Arc::new(a)).context_for(crate::mcp::RequestId::Number(1))
    }

    #[test]
    fn test_sample_catalogue() {
        let registry = sample_registry(Arc::new(StaticFetcher::new(""))).unwrap();
        let uris: Vec<&str> = registry.resources().into_iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec!["file:///greeting.txt", "file:///help.txt", "file:///about.txt"]
        );
        assert_eq!(
            registry.resources()[0].description.as_deref(),
            Some("A sample text resource named greeting")
        );

        let read = registry.read("file:///greeting.txt").unwrap();
        assert_eq!(
            read.contents[0].text.as_deref(),
            Some("Hello! This is a sample text resource.")
        );
    }

    #[tokio::test]
    async fn test_fetch_tool() {
        let registry = sample_registry(Arc::new(StaticFetcher::new("<html>ok</html>"))).unwrap();
        let mut args = Map::new();
        args.insert("url".into(), json!("https://example.com"));
        let result = registry.call_tool(&ctx(), "fetch", args).await.unwrap();
        assert_eq!(result.first_text(), Some("<html>ok</html>"));
    }

    #[test]
    fn test_simple_prompt_messages() {
        let messages = SimplePrompt::create_messages(None, None);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            PromptMessage::user_text("Please help me with whatever questions I may have.")
        );

        let messages = SimplePrompt::create_messages(Some("rust"), Some("lifetimes"));
        assert_eq!(
            messages,
            vec![
                PromptMessage::user_text("Here is some relevant context: rust"),
                PromptMessage::user_text("Please help me with the following topic: lifetimes"),
            ]
        );
    }
}
