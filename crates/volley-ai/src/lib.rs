//! volley-ai: conversation data model and model service boundary
//!
//! This crate holds the types shared by every part of the orchestration
//! engine, the wire frame format, the schema registry for tool arguments and
//! the stream decoder that turns opaque frames into typed events.

pub mod error;
pub mod frame;
pub mod model;
pub mod providers;
pub mod schema;
pub mod stream;
pub mod types;

pub use error::{CallError, DecodeError, Error, Result};
pub use frame::Frame;
pub use model::ModelService;
pub use schema::SchemaRegistry;
pub use stream::{FrameDecoder, FrameStream, StreamDecoder, StreamEvent, StreamEventStream};
pub use types::*;
