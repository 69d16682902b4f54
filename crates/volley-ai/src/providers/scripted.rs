//! Scripted model service that replays canned frame sequences

use std::collections::VecDeque;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::model::ModelService;
use crate::stream::FrameStream;
use crate::types::ModelRequest;

/// Replays one scripted frame list per invocation and records every request
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<String>>>,
    requests: Mutex<Vec<ModelRequest>>,
    frame_delay: Option<Duration>,
    served: Mutex<usize>,
}

impl ScriptedModel {
    /// Create a model from raw frame lines per turn
    pub fn new(turns: Vec<Vec<String>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Default::default()
        }
    }

    /// Create a model from parsed frames per turn
    pub fn from_frames(turns: Vec<Vec<Frame>>) -> Self {
        Self::new(
            turns
                .into_iter()
                .map(|t| t.iter().map(Frame::encode).collect())
                .collect(),
        )
    }

    /// Sleep before yielding each frame
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Number of invocations served so far
    pub fn invocations(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    /// Turns not yet served
    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn invoke(&self, request: ModelRequest) -> Result<FrameStream> {
        self.requests.lock().push(request);
        let frames = {
            let mut served = self.served.lock();
            let frames = self
                .turns
                .lock()
                .pop_front()
                .ok_or(Error::ScriptExhausted(*served))?;
            *served += 1;
            frames
        };

        tracing::debug!("Scripted model serving {} frames", frames.len());

        let delay = self.frame_delay;
        Ok(Box::pin(stream! {
            for frame in frames {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(frame);
            }
        }))
    }
}
