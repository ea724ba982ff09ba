//! Capability registry: the server's catalogue of tools, resources and prompts
//!
//! Built once with [`CapabilityRegistryBuilder`] and immutable afterwards,
//! except for resource content which sits behind a per-resource lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};
use crate::mcp::{
    Content, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool, ToolCallResult,
};
use crate::session::RequestContext;

/// Capability kinds; names are unique within a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &RequestContext, arguments: Map<String, Value>)
        -> Result<ToolCallResult>;
}

#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(
        &self,
        ctx: &RequestContext,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult>;
}

struct ToolEntry {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

struct ResourceEntry {
    resource: Resource,
    content: RwLock<Content>,
}

struct PromptEntry {
    prompt: Prompt,
    handler: Arc<dyn PromptHandler>,
}

/// Logical name of a resource identifier
///
/// Strips the scheme, leading slashes and the extension:
/// `file:///greeting.txt` → `greeting`.
pub fn resource_name(uri: &str) -> &str {
    let path = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let path = path.trim_start_matches('/');
    match path.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => path,
    }
}

#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    tools: Vec<ToolEntry>,
    resources: Vec<ResourceEntry>,
    prompts: Vec<PromptEntry>,
}

impl CapabilityRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, tool: Tool, handler: Arc<dyn ToolHandler>) -> Result<Self> {
        if self.tools.iter().any(|e| e.tool.name == tool.name) {
            return Err(duplicate(CapabilityKind::Tool, &tool.name));
        }
        self.tools.push(ToolEntry { tool, handler });
        Ok(self)
    }

    /// Register a resource; its logical name must be unique
    pub fn resource(mut self, resource: Resource, content: impl Into<Content>) -> Result<Self> {
        let name = resource_name(&resource.uri);
        if self
            .resources
            .iter()
            .any(|e| resource_name(&e.resource.uri) == name)
        {
            return Err(duplicate(CapabilityKind::Resource, &resource.uri));
        }
        self.resources.push(ResourceEntry {
            resource,
            content: RwLock::new(content.into()),
        });
        Ok(self)
    }

    pub fn prompt(mut self, prompt: Prompt, handler: Arc<dyn PromptHandler>) -> Result<Self> {
        if self.prompts.iter().any(|e| e.prompt.name == prompt.name) {
            return Err(duplicate(CapabilityKind::Prompt, &prompt.name));
        }
        self.prompts.push(PromptEntry { prompt, handler });
        Ok(self)
    }

    pub fn build(self) -> CapabilityRegistry {
        let tool_index = self
            .tools
            .iter()
            .enumerate()
            .map(|(i, e)| (e.tool.name.clone(), i))
            .collect();
        let resource_index = self
            .resources
            .iter()
            .enumerate()
            .map(|(i, e)| (resource_name(&e.resource.uri).to_string(), i))
            .collect();
        let prompt_index = self
            .prompts
            .iter()
            .enumerate()
            .map(|(i, e)| (e.prompt.name.clone(), i))
            .collect();

        CapabilityRegistry {
            tools: self.tools,
            tool_index,
            resources: self.resources,
            resource_index,
            prompts: self.prompts,
            prompt_index,
        }
    }
}

fn duplicate(kind: CapabilityKind, name: &str) -> RelayError {
    RelayError::DuplicateCapability {
        kind: kind.as_str(),
        name: name.to_string(),
    }
}

pub struct CapabilityRegistry {
    tools: Vec<ToolEntry>,
    tool_index: HashMap<String, usize>,
    resources: Vec<ResourceEntry>,
    resource_index: HashMap<String, usize>,
    prompts: Vec<PromptEntry>,
    prompt_index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    /// Descriptors of one kind, in registration order
    pub fn list(&self, kind: CapabilityKind) -> Result<Vec<Value>> {
        let values: Vec<Value> = match kind {
            CapabilityKind::Tool => self
                .tools()
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
            CapabilityKind::Resource => self
                .resources()
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
            CapabilityKind::Prompt => self
                .prompts()
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
        };
        Ok(values)
    }

    pub fn tools(&self) -> Vec<&Tool> {
        self.tools.iter().map(|e| &e.tool).collect()
    }

    pub fn resources(&self) -> Vec<&Resource> {
        self.resources.iter().map(|e| &e.resource).collect()
    }

    pub fn prompts(&self) -> Vec<&Prompt> {
        self.prompts.iter().map(|e| &e.prompt).collect()
    }

    /// Look a resource up by any identifier with the same logical name
    pub fn resolve(&self, uri: &str) -> Option<&Resource> {
        self.resource_entry(uri).map(|e| &e.resource)
    }

    fn resource_entry(&self, uri: &str) -> Option<&ResourceEntry> {
        self.resource_index
            .get(resource_name(uri))
            .map(|&i| &self.resources[i])
    }

    /// Invoke a capability with untyped arguments
    ///
    /// For resources `name` is the identifier and `args` is ignored.
    pub async fn invoke(
        &self,
        ctx: &RequestContext,
        kind: CapabilityKind,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        match kind {
            CapabilityKind::Tool => {
                let arguments = match args {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    _ => return Err(RelayError::InvalidParams("arguments must be an object".into())),
                };
                Ok(serde_json::to_value(self.call_tool(ctx, name, arguments).await?)?)
            }
            CapabilityKind::Resource => Ok(serde_json::to_value(self.read(name)?)?),
            CapabilityKind::Prompt => {
                let arguments: HashMap<String, String> = match args {
                    Value::Null => HashMap::new(),
                    other => serde_json::from_value(other)
                        .map_err(|e| RelayError::InvalidParams(e.to_string()))?,
                };
                Ok(serde_json::to_value(self.get_prompt(ctx, name, arguments).await?)?)
            }
        }
    }

    pub async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallResult> {
        let entry = self
            .tool_index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| RelayError::unknown_tool(name))?;

        if let Some(missing) = entry
            .tool
            .required_arguments()
            .into_iter()
            .find(|arg| !arguments.contains_key(*arg))
        {
            return Err(RelayError::MissingArgument(missing.to_string()));
        }

        tracing::debug!("Calling tool {}", name);
        entry.handler.call(ctx, arguments).await
    }

    pub async fn get_prompt(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let entry = self
            .prompt_index
            .get(name)
            .map(|&i| &self.prompts[i])
            .ok_or_else(|| RelayError::unknown_prompt(name))?;

        if let Some(missing) = entry
            .prompt
            .arguments
            .iter()
            .find(|arg| arg.required && !arguments.contains_key(&arg.name))
        {
            return Err(RelayError::MissingArgument(missing.name.clone()));
        }

        entry.handler.get(ctx, arguments).await
    }

    pub fn read(&self, uri: &str) -> Result<ReadResourceResult> {
        let entry = self
            .resource_entry(uri)
            .ok_or_else(|| RelayError::UnknownResource(uri.to_string()))?;
        let contents = entry
            .content
            .read()
            .to_contents(&entry.resource.uri, entry.resource.mime_type.as_deref());
        Ok(ReadResourceResult {
            contents: vec![contents],
        })
    }

    /// Replace a resource's content, returning its canonical identifier
    pub fn update_resource(&self, uri: &str, content: Content) -> Result<&str> {
        let entry = self
            .resource_entry(uri)
            .ok_or_else(|| RelayError::UnknownResource(uri.to_string()))?;
        *entry.content.write() = content;
        Ok(&entry.resource.uri)
    }
}
