//! Tool trait, definitions and the per-session tool registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use volley_ai::{ExecutionDomain, SchemaRegistry, ToolResult, ToolSpec};

use crate::events::SessionEvent;

/// A sender for tool progress updates during execution.
///
/// Tools can use this to emit `ToolExecutionUpdate` events while running.
#[derive(Clone)]
pub struct ProgressSender {
    tx: broadcast::Sender<SessionEvent>,
    call_id: String,
    tool_name: String,
}

impl ProgressSender {
    /// Create a new progress sender for a specific tool invocation.
    pub fn new(
        tx: broadcast::Sender<SessionEvent>,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            call_id: call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Send a progress update.
    pub fn send(&self, content: impl Into<String>) {
        let _ = self.tx.send(SessionEvent::ToolExecutionUpdate {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
    }
}

/// Trait for tools executed by the engine (server side)
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in frames and prompts)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with validated arguments.
    ///
    /// Failures are reported as `ToolResult::error`; the engine never
    /// interrupts a running execution.
    async fn execute(&self, call_id: &str, arguments: serde_json::Value) -> ToolResult;

    /// Execute the tool with progress reporting support.
    ///
    /// Default implementation ignores the progress sender and delegates to `execute()`.
    async fn execute_with_progress(
        &self,
        call_id: &str,
        arguments: serde_json::Value,
        _progress: ProgressSender,
    ) -> ToolResult {
        self.execute(call_id, arguments).await
    }
}

/// Type alias for a boxed tool
pub type BoxedTool = Arc<dyn Tool>;

/// A tool as registered with the engine. The presence of an executor makes
/// it a server-side tool; without one the client must supply the result.
#[derive(Clone)]
pub struct ToolDefinition {
    pub spec: ToolSpec,
    pub executor: Option<BoxedTool>,
}

impl ToolDefinition {
    /// Define a server-side tool from an executor
    pub fn server(tool: BoxedTool) -> Self {
        Self {
            spec: to_spec(tool.as_ref()),
            executor: Some(tool),
        }
    }

    /// Define a client-side tool
    pub fn client(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            spec: ToolSpec::new(name, description, parameters),
            executor: None,
        }
    }

    /// Execution domain implied by the definition
    pub fn domain(&self) -> ExecutionDomain {
        if self.executor.is_some() {
            ExecutionDomain::Server
        } else {
            ExecutionDomain::Client
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.spec.name)
            .field("domain", &self.domain())
            .finish()
    }
}

/// Convert a Tool to the spec advertised to the model
pub fn to_spec(tool: &dyn Tool) -> ToolSpec {
    ToolSpec::new(tool.name(), tool.description(), tool.parameters_schema())
}

/// Tools registered for a session: argument shapes plus executors
#[derive(Clone, Default)]
pub struct ToolRegistry {
    schemas: Arc<SchemaRegistry>,
    executors: HashMap<String, BoxedTool>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool definition. Names must be unique.
    pub fn register(&mut self, definition: ToolDefinition) -> volley_ai::Result<()> {
        let domain = definition.domain();
        let name = definition.spec.name.clone();
        Arc::make_mut(&mut self.schemas).register(definition.spec, domain)?;
        if let Some(executor) = definition.executor {
            self.executors.insert(name, executor);
        }
        Ok(())
    }

    /// Shared schema registry
    pub fn schemas(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schemas)
    }

    /// Executor for a server-side tool
    pub fn executor(&self, name: &str) -> Option<BoxedTool> {
        self.executors.get(name).cloned()
    }

    /// Tool names in registration order
    pub fn names(&self) -> Vec<String> {
        self.schemas.specs().into_iter().map(|s| s.name).collect()
    }
}
