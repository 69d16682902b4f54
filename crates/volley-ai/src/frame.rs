//! Wire frames: one `<code>:<json>` line per frame

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::{FinishReason, Usage};

/// A parsed protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `0:` text delta
    Text(String),
    /// `b:` tool call streaming started
    ToolCallStart(ToolCallStartPayload),
    /// `c:` tool call argument fragment
    ToolCallDelta(ToolCallDeltaPayload),
    /// `9:` tool call complete
    ToolCall(ToolCallPayload),
    /// `d:` turn finished
    Finish(FinishPayload),
    /// `3:` error reported by the model service
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStartPayload {
    pub tool_call_id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDeltaPayload {
    pub tool_call_id: String,
    pub args_text_delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishPayload {
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: WireUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
        }
    }
}

impl Frame {
    /// Parse one frame line
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (code, payload) = line
            .split_once(':')
            .ok_or_else(|| DecodeError::Malformed(truncate(line)))?;

        let mut chars = code.chars();
        let code = match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => return Err(DecodeError::Malformed(truncate(line))),
        };

        match code {
            '0' => Ok(Frame::Text(payload_json(code, payload)?)),
            'b' => Ok(Frame::ToolCallStart(payload_json(code, payload)?)),
            'c' => Ok(Frame::ToolCallDelta(payload_json(code, payload)?)),
            '9' => Ok(Frame::ToolCall(payload_json(code, payload)?)),
            'd' => Ok(Frame::Finish(payload_json(code, payload)?)),
            '3' => Ok(Frame::Error(payload_json(code, payload)?)),
            other => Err(DecodeError::UnknownCode(other.to_string())),
        }
    }

    /// Encode this frame as a line (without trailing newline)
    pub fn encode(&self) -> String {
        // Serializing these payloads cannot fail: all keys are strings.
        let json = |v: serde_json::Result<String>| v.unwrap_or_default();
        match self {
            Frame::Text(t) => format!("0:{}", json(serde_json::to_string(t))),
            Frame::ToolCallStart(p) => format!("b:{}", json(serde_json::to_string(p))),
            Frame::ToolCallDelta(p) => format!("c:{}", json(serde_json::to_string(p))),
            Frame::ToolCall(p) => format!("9:{}", json(serde_json::to_string(p))),
            Frame::Finish(p) => format!("d:{}", json(serde_json::to_string(p))),
            Frame::Error(m) => format!("3:{}", json(serde_json::to_string(m))),
        }
    }

    /// Text delta frame
    pub fn text(delta: impl Into<String>) -> Self {
        Frame::Text(delta.into())
    }

    /// Tool call start frame
    pub fn tool_call_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Frame::ToolCallStart(ToolCallStartPayload {
            tool_call_id: id.into(),
            tool_name: name.into(),
        })
    }

    /// Tool call argument fragment frame
    pub fn tool_call_delta(id: impl Into<String>, fragment: impl Into<String>) -> Self {
        Frame::ToolCallDelta(ToolCallDeltaPayload {
            tool_call_id: id.into(),
            args_text_delta: fragment.into(),
        })
    }

    /// Complete tool call frame
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Frame::ToolCall(ToolCallPayload {
            tool_call_id: id.into(),
            tool_name: name.into(),
            args,
        })
    }

    /// Finish frame
    pub fn finish(reason: FinishReason, usage: Usage) -> Self {
        Frame::Finish(FinishPayload {
            finish_reason: reason,
            usage: WireUsage {
                prompt_tokens: usage.input,
                completion_tokens: usage.output,
            },
        })
    }
}

fn payload_json<T: serde::de::DeserializeOwned>(code: char, payload: &str) -> Result<T, DecodeError> {
    serde_json::from_str(payload).map_err(|e| DecodeError::InvalidPayload {
        code,
        message: e.to_string(),
    })
}

fn truncate(line: &str) -> String {
    const MAX: usize = 64;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
