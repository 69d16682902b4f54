//! Model service implementations

pub mod scripted;
pub mod sse;

pub use scripted::ScriptedModel;
pub use sse::SseModelService;
