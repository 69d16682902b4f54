//! Session event types

use serde::{Deserialize, Serialize};
use volley_ai::{FinishReason, Message, ToolResult, Usage};

use crate::controller::{RoundtripState, SessionOutcome};
use crate::ledger::PendingClientCall;

/// Events emitted during a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session started processing
    SessionStart,

    /// A new model turn started
    TurnStart { turn_number: u32 },

    /// A message was appended to the conversation
    MessageAppended { message: Message },

    /// The assistant message of the live turn changed
    MessageUpdate { message: Message },

    /// Text streamed for the live assistant message
    TextDelta { message_id: String, delta: String },

    /// The model started a tool call
    ToolCallStart { call_id: String, tool_name: String },

    /// Argument text streamed for a tool call
    ToolCallDelta { call_id: String, fragment: String },

    /// A client-side call needs an externally supplied result
    ClientToolCall { call: PendingClientCall },

    /// A client result was accepted
    ClientResultReceived { call_id: String },

    /// Server-side tool execution started
    ToolExecutionStart {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution progress update (emitted by tools during execution)
    ToolExecutionUpdate {
        call_id: String,
        tool_name: String,
        content: String,
    },

    /// Server-side tool execution completed
    ToolExecutionEnd {
        call_id: String,
        tool_name: String,
        result: ToolResult,
    },

    /// The roundtrip controller moved to a new state
    StateChanged { state: RoundtripState },

    /// A model turn completed
    TurnEnd {
        turn_number: u32,
        finish_reason: Option<FinishReason>,
        usage: Usage,
    },

    /// Session finished processing
    SessionEnd { outcome: SessionOutcome },

    /// Error occurred
    Error { message: String },
}

impl SessionEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::SessionEnd { .. })
    }
}
