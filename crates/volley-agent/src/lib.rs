//! volley-agent: tool-invocation orchestration runtime
//!
//! This crate provides the session loop that streams model turns, tracks
//! every tool call in an invocation ledger, runs server-side tools, waits for
//! client-side results and decides when to re-invoke the model.

pub mod config;
pub mod context;
pub mod controller;
pub mod conversation;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod ledger;
pub mod tool;

pub use config::EngineConfig;
pub use context::ContextAssembler;
pub use controller::{
    Continuation, RoundtripController, RoundtripState, SessionOutcome, TerminalState,
};
pub use conversation::{Conversation, SessionCheckpoint};
pub use dispatch::{Dispatch, DispatchCoordinator};
pub use engine::Engine;
pub use error::{Error, ProtocolViolation, Result};
pub use events::SessionEvent;
pub use handle::SessionHandle;
pub use ledger::{InvocationLedger, LedgerCheckpoint, LedgerError, PendingClientCall};
pub use tool::{BoxedTool, ProgressSender, Tool, ToolDefinition, ToolRegistry};
