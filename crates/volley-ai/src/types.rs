//! Core types for orchestrated conversations

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// Where a tool executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDomain {
    /// Executed by the engine inside its trust boundary
    Server,
    /// Resolved externally through the client result boundary
    Client,
}

/// Lifecycle state of a tool invocation. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationState {
    /// Arguments still streaming
    PartialCall,
    /// Arguments decoded, not yet resolved
    Call,
    /// Resolved with a result
    Result,
}

/// Outcome of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Value handed back to the model
    pub value: serde_json::Value,
    /// Whether the invocation failed
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result from any JSON value
    pub fn value(value: serde_json::Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self::value(serde_json::Value::String(text.into()))
    }

    /// Create an execution error result
    pub fn error(message: impl Into<String>) -> Self {
        Self::failed(&CallError::ToolExecution {
            message: message.into(),
        })
    }

    /// Create a failed result from a per-call error
    pub fn failed(error: &CallError) -> Self {
        Self {
            value: error.to_value(),
            is_error: true,
        }
    }

    /// Render the value as text for display
    pub fn text_content(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A tool call and its eventual result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Call id, unique within a turn
    pub call_id: String,
    /// Name of the invoked tool
    pub tool_name: String,
    /// Execution domain
    pub domain: ExecutionDomain,
    /// Current lifecycle state
    pub state: InvocationState,
    /// Validated arguments (present from `Call` on, unless the call failed early)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    /// Result (present only in `Result`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// Handed off to the client and waiting for an external result
    #[serde(default)]
    pub awaiting_client: bool,
}

impl ToolInvocation {
    /// Create an invocation whose arguments are still streaming
    pub fn partial(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        domain: ExecutionDomain,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            domain,
            state: InvocationState::PartialCall,
            arguments: None,
            result: None,
            awaiting_client: false,
        }
    }

    /// Check if this invocation has a result
    pub fn is_resolved(&self) -> bool {
        self.state == InvocationState::Result
    }

    /// Check if this invocation resolved with an error
    pub fn is_failed(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.is_error)
    }
}

/// One message of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id
    pub id: String,
    /// Role of the author
    pub role: Role,
    /// Text content (possibly empty)
    #[serde(default)]
    pub content: String,
    /// Tool invocations produced by this message, in call order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    /// Creation time in epoch milliseconds
    pub created_at: i64,
}

impl Message {
    /// Create a message with the given role and text
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_invocations: vec![],
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Create an empty assistant message
    pub fn assistant_empty() -> Self {
        Self::new(Role::Assistant, "")
    }

    /// Check whether every tool invocation has a result
    pub fn all_resolved(&self) -> bool {
        self.tool_invocations.iter().all(|i| i.is_resolved())
    }

    /// Look up an invocation by call id
    pub fn invocation(&self, call_id: &str) -> Option<&ToolInvocation> {
        self.tool_invocations.iter().find(|i| i.call_id == call_id)
    }

    /// Check if a message has meaningful content worth sending to the model
    pub fn has_meaningful_content(&self) -> bool {
        !self.content.trim().is_empty() || !self.tool_invocations.is_empty()
    }
}

/// Reason a turn finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Natural end of response
    Stop,
    /// Tool use requested
    ToolCalls,
    /// Maximum tokens reached
    Length,
    /// Error occurred
    Error,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
}

impl Usage {
    /// Add another usage report to this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
    }

    /// Total tokens
    pub fn total(&self) -> u32 {
        self.input.saturating_add(self.output)
    }
}

/// Tool definition as advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (used in frames and prompts)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for the arguments
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    /// Create a new tool spec
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Generation settings passed through to the model service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A tool call as presented to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// A prompt entry for the next model invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum PromptMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<PromptToolCall>,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl PromptMessage {
    /// Get the role of this entry
    pub fn role(&self) -> Role {
        match self {
            PromptMessage::System { .. } => Role::System,
            PromptMessage::User { .. } => Role::User,
            PromptMessage::Assistant { .. } => Role::Assistant,
            PromptMessage::Tool { .. } => Role::Tool,
        }
    }
}

/// Everything the model service needs for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// System prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Ordered prompt entries
    pub messages: Vec<PromptMessage>,
    /// Available tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Generation settings
    #[serde(default)]
    pub settings: GenerationSettings,
}
