//! Conversation state: messages, usage and streaming status.

use serde::{Deserialize, Serialize};
use volley_ai::{Message, Role, Usage};

/// Conversation state: messages, usage and streaming status.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Whether a model stream is currently being consumed
    pub is_streaming: bool,
    /// Total usage across all turns
    pub total_usage: Usage,
    /// Last error
    pub error: Option<String>,
}

impl Conversation {
    /// Last assistant message, if it is the final message
    pub fn trailing_assistant_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut().filter(|m| m.role == Role::Assistant)
    }
}

/// Serializable snapshot of a session between runs. Invocations travel
/// embedded in their assistant messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    /// Full message history
    pub messages: Vec<Message>,
    /// Accumulated usage
    #[serde(default)]
    pub total_usage: Usage,
}
