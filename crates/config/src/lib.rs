//! Configuration loading, validation, and management for Promptgate.
//!
//! Loads configuration from `~/.promptgate/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.promptgate/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the inference backend
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Default model name (per-conversation overrides win)
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Operating system prompt prepended to every request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Input validation limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retry, timeout and availability-probe settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Streaming delivery settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Generation parameters sent with every chat request
    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_server_url() -> String {
    "http://localhost:11434".into()
}
fn default_model() -> String {
    "deepseek-r1:14b".into()
}
fn default_system_prompt() -> String {
    "Eres un asistente corporativo. Responde de forma clara, profesional y \
     en el idioma del usuario. No reveles informacion confidencial, \
     credenciales ni datos personales de empleados. Si una peticion viola \
     las politicas de seguridad, rechazala cortesmente."
        .into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accepted length of a user message, in characters
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Per-URL character budget for extracted page text
    #[serde(default = "default_url_extract_max_chars")]
    pub url_extract_max_chars: usize,
}

fn default_max_message_length() -> usize {
    4000
}
fn default_url_extract_max_chars() -> usize {
    8000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            url_extract_max_chars: default_url_extract_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Total attempts for a transient failure (first try included)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base wait before the second attempt; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Per-request deadline for chat calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Deadline for the availability probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// How long a probe result stays fresh
    #[serde(default = "default_availability_ttl_secs")]
    pub availability_ttl_secs: u64,
}

fn default_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_availability_ttl_secs() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            availability_ttl_secs: default_availability_ttl_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn availability_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Keep-alive comment interval while waiting for the first chunk
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Absolute deadline for a streaming response
    #[serde(default = "default_stream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    15
}
fn default_stream_timeout_secs() -> u64 {
    600
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            timeout_secs: default_stream_timeout_secs(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_num_ctx() -> u32 {
    4096
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            num_ctx: default_num_ctx(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.promptgate/config.toml).
    ///
    /// Environment variable overrides (highest priority):
    /// - `PROMPTGATE_SERVER_URL`
    /// - `PROMPTGATE_MODEL`
    /// - `PROMPTGATE_SYSTEM_PROMPT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(url) = std::env::var("PROMPTGATE_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(model) = std::env::var("PROMPTGATE_MODEL") {
            config.default_model = model;
        }
        if let Ok(prompt) = std::env::var("PROMPTGATE_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptgate")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server_url must not be empty".into(),
            ));
        }

        if self.upstream.retries == 0 {
            return Err(ConfigError::ValidationError(
                "upstream.retries must be at least 1".into(),
            ));
        }

        if self.generation.temperature < 0.0 || self.generation.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "generation.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.limits.max_message_length == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_message_length must be > 0".into(),
            ));
        }

        if self.stream.heartbeat_secs >= self.stream.timeout_secs {
            return Err(ConfigError::ValidationError(
                "stream.heartbeat_secs must be shorter than stream.timeout_secs".into(),
            ));
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            default_model: default_model(),
            system_prompt: default_system_prompt(),
            limits: LimitsConfig::default(),
            upstream: UpstreamConfig::default(),
            stream: StreamConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
