//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use volley_agent::EngineConfig;

/// Configuration for volley
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Automatic model re-invocations per request
    pub max_automatic_roundtrips: Option<u32>,
    /// Store per-call failures as error results instead of ending the session
    pub error_tolerant: Option<bool>,
    /// System prompt sent with every model invocation
    pub system_prompt: Option<String>,
    /// Maximum tokens to generate per turn
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Capacity of the session event channel
    pub event_buffer: Option<usize>,
    /// Model service settings, used when a script carries no turns
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Streaming model service endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// URL accepting a JSON request and answering with an SSE frame stream
    pub endpoint: Option<String>,
    /// Bearer token (alternative to the VOLLEY_API_KEY environment variable)
    pub api_key: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("volley")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for VOLLEY_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("VOLLEY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file. A missing or broken file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            max_automatic_roundtrips: Some(2),
            error_tolerant: Some(true),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Engine configuration with file values applied over the defaults
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        if let Some(max) = self.max_automatic_roundtrips {
            engine.max_automatic_roundtrips = max;
        }
        if let Some(tolerant) = self.error_tolerant {
            engine.error_tolerant = tolerant;
        }
        if let Some(buffer) = self.event_buffer {
            engine.event_buffer = buffer;
        }
        engine.system_prompt = self.system_prompt.clone();
        engine.settings.max_tokens = self.max_tokens;
        engine.settings.temperature = self.temperature;
        engine
    }

    /// Get the service API key, checking config then env
    pub fn api_key(&self) -> Option<String> {
        self.service
            .api_key
            .clone()
            .or_else(|| std::env::var("VOLLEY_API_KEY").ok())
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# volley configuration file
# Place at ~/.config/volley/config.toml (Linux/Mac) or %APPDATA%\volley\config.toml (Windows)

# Automatic model re-invocations per user request (0 disables auto-continue)
max_automatic_roundtrips = 2

# Store failed tool calls as error results (false ends the session instead)
error_tolerant = true

# System prompt sent with every model invocation (optional)
# system_prompt = "You are a helpful assistant."

# Generation settings (optional)
# max_tokens = 1024
# temperature = 0.7

# Streaming model service used when a script has no scripted turns
[service]
# endpoint = "http://localhost:8080/chat"
# api_key = "..."
"#
}
