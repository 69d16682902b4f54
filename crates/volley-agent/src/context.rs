//! Builds the prompt for the next model invocation

use std::sync::Arc;
use volley_ai::{
    GenerationSettings, Message, ModelRequest, PromptMessage, PromptToolCall, Role,
    SchemaRegistry, ToolInvocation,
};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Assembles `ModelRequest`s from conversation history.
///
/// Every tool call is followed by exactly one tool result entry carrying the
/// same call id, in the order the calls were made. History with an
/// unresolved invocation cannot be assembled.
pub struct ContextAssembler {
    system: Option<String>,
    settings: GenerationSettings,
    registry: Arc<SchemaRegistry>,
}

impl ContextAssembler {
    pub fn new(config: &EngineConfig, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            system: config.system_prompt.clone(),
            settings: config.settings.clone(),
            registry,
        }
    }

    /// Build the request for `history`
    pub fn assemble(&self, history: &[Message]) -> Result<ModelRequest> {
        let mut messages = Vec::with_capacity(history.len());

        for message in history {
            match message.role {
                Role::System => messages.push(PromptMessage::System {
                    content: message.content.clone(),
                }),
                Role::User => messages.push(PromptMessage::User {
                    content: message.content.clone(),
                }),
                Role::Assistant => {
                    // Aborted or empty turns carry nothing the model can use
                    if !message.has_meaningful_content() {
                        continue;
                    }
                    let tool_calls = message
                        .tool_invocations
                        .iter()
                        .map(|inv| PromptToolCall {
                            call_id: inv.call_id.clone(),
                            tool_name: inv.tool_name.clone(),
                            arguments: inv
                                .arguments
                                .clone()
                                .unwrap_or_else(|| serde_json::json!({})),
                        })
                        .collect();
                    let results = tool_results(&message.tool_invocations)?;
                    messages.push(PromptMessage::Assistant {
                        content: message.content.clone(),
                        tool_calls,
                    });
                    messages.extend(results);
                }
                Role::Tool => messages.extend(tool_results(&message.tool_invocations)?),
            }
        }

        Ok(ModelRequest {
            system: self.system.clone(),
            messages,
            tools: self.registry.specs(),
            settings: self.settings.clone(),
        })
    }
}

fn tool_results(invocations: &[ToolInvocation]) -> Result<Vec<PromptMessage>> {
    invocations
        .iter()
        .map(|inv| {
            let result = inv.result.as_ref().filter(|_| inv.is_resolved()).ok_or_else(|| {
                Error::Context(format!(
                    "tool call '{}' ({}) has no result",
                    inv.call_id, inv.tool_name
                ))
            })?;
            Ok(PromptMessage::Tool {
                tool_call_id: inv.call_id.clone(),
                tool_name: inv.tool_name.clone(),
                content: result.value.clone(),
                is_error: result.is_error,
            })
        })
        .collect()
}
