//! Model invocation boundary

use async_trait::async_trait;

use crate::error::Result;
use crate::stream::FrameStream;
use crate::types::ModelRequest;

/// An external model service.
///
/// Each invocation returns a lazy, finite, non-restartable frame stream
/// that is terminated by exactly one finish frame.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Start one model turn
    async fn invoke(&self, request: ModelRequest) -> Result<FrameStream>;
}
