use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ToolError;
use crate::types::{ResourceDescriptor, ToolSchema};

/// Discovers and executes tools on behalf of the engine. Implementations
/// own the transport; the engine only sees schemas and string results.
#[async_trait]
pub trait ToolExecutionService: Send + Sync {
    /// Fetch the available tool schemas. Called once per conversation.
    async fn discover_tools(&self) -> Result<Vec<ToolSchema>, ToolError>;

    /// Invoke a tool by name. The result is the raw string payload fed
    /// back to the model.
    async fn execute(&self, name: &str, arguments: &Map<String, Value>)
        -> Result<String, ToolError>;
}

/// Optional source of resource descriptors, consulted once on turn one.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ToolError>;
}

/// A tool's execution handler. Consumers implement this for each tool.
/// `Err` carries a message for the model, not a transport failure.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<String, String>;
}

struct ToolDef {
    schema: ToolSchema,
    handler: Box<dyn ToolHandler>,
}

/// Catalog of locally-registered tools: schemas for the prompt, handlers
/// for execution.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn add(mut self, schema: ToolSchema, handler: impl ToolHandler + 'static) -> Self {
        self.tools.push(ToolDef {
            schema,
            handler: Box::new(handler),
        });
        self
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.schema.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub async fn execute(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.schema.name == name)
            .ok_or_else(|| ToolError::Execution(format!("unknown tool: {name}")))?;
        tool.handler
            .call(arguments)
            .await
            .map_err(ToolError::Execution)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process tool service over a [`ToolRegistry`]. The canonical default —
/// no transport, optional per-call timeout.
pub struct LocalToolService {
    registry: ToolRegistry,
    timeout: Option<Duration>,
}

impl LocalToolService {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolExecutionService for LocalToolService {
    async fn discover_tools(&self) -> Result<Vec<ToolSchema>, ToolError> {
        Ok(self.registry.schemas())
    }

    async fn execute(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, ToolError> {
        debug!(tool = name, "executing local tool");
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.registry.execute(name, arguments))
                .await
                .map_err(|_| ToolError::Timeout(limit.as_millis() as u64))?,
            None => self.registry.execute(name, arguments).await,
        }
    }
}
