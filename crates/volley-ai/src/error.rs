//! Error types for volley-ai

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using volley-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised at the model service boundary and while decoding frames
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// The frame stream could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A tool definition could not be registered
    #[error("Invalid tool definition '{name}': {reason}")]
    InvalidTool { name: String, reason: String },

    /// The scripted model ran out of turns
    #[error("Model script exhausted after {0} turns")]
    ScriptExhausted(usize),
}

/// Fatal decode failures. Any of these aborts the turn: once the frame
/// sequence is broken argument integrity can no longer be guaranteed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame did not have the `<code>:<json>` shape
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame code is not part of the protocol
    #[error("unknown frame code '{0}'")]
    UnknownCode(String),

    /// The frame payload was not valid JSON for its code
    #[error("invalid payload for frame code '{code}': {message}")]
    InvalidPayload { code: char, message: String },

    /// Arguments or end arrived for a call that never started
    #[error("frame references unknown tool call '{0}'")]
    UnknownCall(String),

    /// The same call id was started twice
    #[error("tool call '{0}' started twice")]
    DuplicateCall(String),

    /// A call was still streaming arguments when the turn finished
    #[error("tool call '{0}' was not terminated before finish")]
    UnterminatedCall(String),

    /// A frame arrived after the finish frame
    #[error("frame received after finish")]
    TrailingFrame,

    /// The stream ended without a finish frame
    #[error("stream ended without a finish frame")]
    MissingFinish,

    /// The underlying transport failed mid-stream
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Per-call failures. These never abort a turn; they are stored as the
/// failed result of the affected invocation so the model can react to them.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CallError {
    /// The call referenced a tool that is not registered
    #[error("Tool not found: {name}")]
    UnknownTool { name: String },

    /// The arguments did not parse or did not match the tool's shape
    #[error("{message}")]
    ArgumentValidation { message: String },

    /// The tool ran and failed
    #[error("Tool execution failed: {message}")]
    ToolExecution { message: String },

    /// The turn ended before the call could produce a result
    #[error("Tool call abandoned: {reason}")]
    Abandoned { reason: String },
}

impl CallError {
    /// Short machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::UnknownTool { .. } => "unknown-tool",
            CallError::ArgumentValidation { .. } => "argument-validation",
            CallError::ToolExecution { .. } => "tool-execution",
            CallError::Abandoned { .. } => "abandoned",
        }
    }

    /// Structured error value stored as the invocation's result
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}
