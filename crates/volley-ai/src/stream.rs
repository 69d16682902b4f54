//! Stream decoding: opaque frames in, typed events out

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::error::{CallError, DecodeError};
use crate::frame::Frame;
use crate::schema::SchemaRegistry;
use crate::types::{FinishReason, Usage};

/// A stream of raw frames from the model service
pub type FrameStream = Pin<Box<dyn Stream<Item = crate::Result<String>> + Send>>;

/// A stream of decoded events. A `DecodeError` is always the last item.
pub type StreamEventStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, DecodeError>> + Send>>;

/// Events emitted while decoding a turn, in exact arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Text content delta
    TextDelta { delta: String },
    /// Tool call started
    ToolCallStart { call_id: String, tool_name: String },
    /// Tool call arguments delta (verbatim fragment)
    ToolCallArgDelta { call_id: String, fragment: String },
    /// Tool call arguments complete, parsed and validated
    ToolCallEnd {
        call_id: String,
        tool_name: String,
        arguments: Result<serde_json::Value, CallError>,
    },
    /// The model service reported an error; the turn is over
    Error { message: String },
    /// Turn completed
    Finish { reason: FinishReason, usage: Usage },
}

impl StreamEvent {
    /// Check if this is a terminal event (Finish or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }
}

#[derive(Debug)]
struct OpenCall {
    id: String,
    name: String,
    arguments_json: String,
}

/// Synchronous frame decoder holding the state of a single turn.
///
/// Frames are applied one at a time; the decoder never reorders output and
/// keeps no state across turns.
#[derive(Debug)]
pub struct FrameDecoder {
    registry: Arc<SchemaRegistry>,
    open: Vec<OpenCall>,
    seen: HashSet<String>,
    finished: bool,
}

impl FrameDecoder {
    /// Create a decoder validating arguments against `registry`
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            open: vec![],
            seen: HashSet::new(),
            finished: false,
        }
    }

    /// Whether a terminal frame has been applied
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse and apply one raw frame line
    pub fn push_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, DecodeError> {
        if line.trim().is_empty() {
            return Ok(vec![]);
        }
        let frame = Frame::parse(line)?;
        self.push(frame)
    }

    /// Apply one parsed frame
    pub fn push(&mut self, frame: Frame) -> Result<Vec<StreamEvent>, DecodeError> {
        if self.finished {
            return Err(DecodeError::TrailingFrame);
        }

        match frame {
            Frame::Text(delta) => Ok(vec![StreamEvent::TextDelta { delta }]),
            Frame::ToolCallStart(p) => {
                self.start(&p.tool_call_id, &p.tool_name)?;
                Ok(vec![StreamEvent::ToolCallStart {
                    call_id: p.tool_call_id,
                    tool_name: p.tool_name,
                }])
            }
            Frame::ToolCallDelta(p) => {
                let call = self
                    .open
                    .iter_mut()
                    .find(|c| c.id == p.tool_call_id)
                    .ok_or_else(|| DecodeError::UnknownCall(p.tool_call_id.clone()))?;
                call.arguments_json.push_str(&p.args_text_delta);
                Ok(vec![StreamEvent::ToolCallArgDelta {
                    call_id: p.tool_call_id,
                    fragment: p.args_text_delta,
                }])
            }
            Frame::ToolCall(p) => {
                if let Some(pos) = self.open.iter().position(|c| c.id == p.tool_call_id) {
                    let call = self.open.remove(pos);
                    if call.name != p.tool_name {
                        tracing::warn!(
                            "Tool call '{}' completed as '{}' but started as '{}'",
                            call.id,
                            p.tool_name,
                            call.name
                        );
                    }
                    return Ok(vec![self.end(call)]);
                }
                if self.seen.contains(&p.tool_call_id) {
                    return Err(DecodeError::DuplicateCall(p.tool_call_id));
                }

                // Non-streamed call: synthesize the full start/delta/end sequence.
                self.start(&p.tool_call_id, &p.tool_name)?;
                let fragment = if p.args.is_null() {
                    String::new()
                } else {
                    p.args.to_string()
                };
                let mut events = vec![StreamEvent::ToolCallStart {
                    call_id: p.tool_call_id.clone(),
                    tool_name: p.tool_name.clone(),
                }];
                if !fragment.is_empty() {
                    events.push(StreamEvent::ToolCallArgDelta {
                        call_id: p.tool_call_id.clone(),
                        fragment: fragment.clone(),
                    });
                }
                let call = OpenCall {
                    id: p.tool_call_id,
                    name: p.tool_name,
                    arguments_json: fragment,
                };
                self.open.retain(|c| c.id != call.id);
                events.push(self.end(call));
                Ok(events)
            }
            Frame::Finish(p) => {
                if let Some(call) = self.open.first() {
                    return Err(DecodeError::UnterminatedCall(call.id.clone()));
                }
                self.finished = true;
                Ok(vec![StreamEvent::Finish {
                    reason: p.finish_reason,
                    usage: p.usage.into(),
                }])
            }
            Frame::Error(message) => {
                self.finished = true;
                Ok(vec![StreamEvent::Error { message }])
            }
        }
    }

    /// Check that the stream ended at a valid point
    pub fn end_of_stream(&self) -> Result<(), DecodeError> {
        if self.finished {
            Ok(())
        } else {
            Err(DecodeError::MissingFinish)
        }
    }

    fn start(&mut self, id: &str, name: &str) -> Result<(), DecodeError> {
        if !self.seen.insert(id.to_string()) {
            return Err(DecodeError::DuplicateCall(id.to_string()));
        }
        if !self.registry.contains(name) {
            tracing::warn!("Tool call '{}' references unknown tool '{}'", id, name);
        }
        self.open.push(OpenCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments_json: String::new(),
        });
        Ok(())
    }

    fn end(&self, call: OpenCall) -> StreamEvent {
        let arguments = if self.registry.contains(&call.name) {
            self.registry
                .parse_and_validate(&call.name, &call.arguments_json)
        } else {
            Err(CallError::UnknownTool {
                name: call.name.clone(),
            })
        };
        StreamEvent::ToolCallEnd {
            call_id: call.id,
            tool_name: call.name,
            arguments,
        }
    }
}

/// Decodes a frame stream into a lazy event stream
pub struct StreamDecoder {
    registry: Arc<SchemaRegistry>,
}

impl StreamDecoder {
    /// Create a new stream decoder
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Decode `frames` lazily. The returned stream ends after the first
    /// terminal event or the first `DecodeError`.
    pub fn decode(self, mut frames: FrameStream) -> StreamEventStream {
        let mut decoder = FrameDecoder::new(self.registry);

        Box::pin(stream! {
            while let Some(item) = frames.next().await {
                let line = match item {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(DecodeError::Transport(e.to_string()));
                        return;
                    }
                };

                tracing::trace!("frame: {}", line);

                match decoder.push_line(&line) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }

                if decoder.is_finished() {
                    break;
                }
            }

            if decoder.is_finished() {
                // Anything left on the wire after finish is a protocol error.
                if let Some(item) = frames.next().await {
                    match item {
                        Ok(line) if line.trim().is_empty() => {}
                        Ok(_) => yield Err(DecodeError::TrailingFrame),
                        Err(e) => yield Err(DecodeError::Transport(e.to_string())),
                    }
                }
            } else if let Err(e) = decoder.end_of_stream() {
                yield Err(e);
            }
        })
    }
}
