//! Conversation scripts replayed by `volley run`

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use volley_agent::{Tool, ToolDefinition};
use volley_ai::ToolResult;

/// A scripted conversation
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// User prompt that starts the session
    pub prompt: String,
    /// System prompt (overrides the config file)
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tools available to the model
    #[serde(default)]
    pub tools: Vec<ScriptTool>,
    /// Raw frame lines per model turn
    #[serde(default)]
    pub turns: Vec<Vec<String>>,
    /// Results for client-side calls, by call id
    #[serde(default)]
    pub client_results: HashMap<String, serde_json::Value>,
}

/// A tool declared by a script.
///
/// With `result` or `error` it runs server-side and answers with that
/// value; without either the client must supply the result.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl Script {
    /// Read a script from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid script {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Tool definitions for the engine
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ScriptTool::definition).collect()
    }
}

impl ScriptTool {
    fn definition(&self) -> ToolDefinition {
        let canned = match (&self.error, &self.result) {
            (Some(message), _) => Some(ToolResult::error(message.clone())),
            (None, Some(value)) => Some(ToolResult::value(value.clone())),
            (None, None) => None,
        };
        match canned {
            Some(result) => ToolDefinition::server(Arc::new(StaticTool {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
                result,
            })),
            None => ToolDefinition::client(
                self.name.clone(),
                self.description.clone(),
                self.parameters.clone(),
            ),
        }
    }
}

/// Server-side tool answering every call with a fixed result
struct StaticTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    result: ToolResult,
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn execute(&self, call_id: &str, _arguments: serde_json::Value) -> ToolResult {
        tracing::debug!("{} answering call '{}'", self.name, call_id);
        self.result.clone()
    }
}
