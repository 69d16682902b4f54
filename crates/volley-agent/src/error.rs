//! Error types for volley-agent

use thiserror::Error;
use volley_ai::{CallError, DecodeError};

use crate::controller::RoundtripState;

/// Result type alias using volley-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that terminate a session
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model service layer
    #[error(transparent)]
    Ai(#[from] volley_ai::Error),

    /// The frame stream could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A ledger or client-boundary invariant was broken
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The model service reported an error for the turn
    #[error("Model error: {0}")]
    Model(String),

    /// A per-call failure escalated because error tolerance is off
    #[error("Tool call '{call_id}' failed: {error}")]
    ToolFailure { call_id: String, error: CallError },

    /// The next prompt could not be assembled
    #[error("Context assembly failed: {0}")]
    Context(String),

    /// The roundtrip controller rejected an event for its current state
    #[error("Invalid transition from {from:?} on {event}")]
    InvalidTransition {
        from: RoundtripState,
        event: &'static str,
    },

    /// Checkpoint serialization failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] serde_json::Error),

    /// The session was cancelled by the caller
    #[error("Session cancelled")]
    Cancelled,

    /// There is nothing to resume
    #[error("Nothing to resume: {0}")]
    NothingToResume(String),
}

impl Error {
    /// Check whether this error came from a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Invariant breaches at the ledger and client result boundary.
/// These indicate misuse or a broken peer, never bad tool input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("tool call id '{0}' registered twice")]
    DuplicateCallId(String),

    #[error("tool call id '{0}' is not known in this turn")]
    UnknownCallId(String),

    #[error("result for tool call '{0}' was already set")]
    ResultAlreadySet(String),

    #[error("arguments for tool call '{0}' were already set")]
    ArgumentsAlreadySet(String),

    #[error("tool call '{0}' has no arguments yet")]
    ArgumentsNotSet(String),

    #[error("tool call '{0}' is not resolved by the client")]
    NotClientSide(String),

    #[error("turn is closed; result for tool call '{0}' discarded")]
    TurnClosed(String),

    #[error("no turn is live")]
    TurnNotLive,
}
