//! Engine configuration

use serde::{Deserialize, Serialize};
use volley_ai::GenerationSettings;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Automatic model re-invocations allowed per user request.
    /// 0 disables auto-continue.
    pub max_automatic_roundtrips: u32,
    /// Store per-call failures as error results instead of ending the session
    pub error_tolerant: bool,
    /// System prompt sent with every model invocation
    pub system_prompt: Option<String>,
    /// Generation settings passed to the model service
    pub settings: GenerationSettings,
    /// Capacity of the session event broadcast channel
    pub event_buffer: usize,
    /// How long to watch for stray frames after `finish` before the stream
    /// is dropped. A service holding the connection open costs at most this.
    pub finish_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_automatic_roundtrips: 0,
            error_tolerant: true,
            system_prompt: None,
            settings: GenerationSettings::default(),
            event_buffer: 256,
            finish_grace_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Set the roundtrip budget
    pub fn with_max_automatic_roundtrips(mut self, max: u32) -> Self {
        self.max_automatic_roundtrips = max;
        self
    }

    /// Set error tolerance
    pub fn with_error_tolerant(mut self, tolerant: bool) -> Self {
        self.error_tolerant = tolerant;
        self
    }

    /// Set the system prompt
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
