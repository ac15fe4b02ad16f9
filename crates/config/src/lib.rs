//! Configuration loading, validation, and management for Hearth.
//!
//! Loads configuration from `~/.hearth/config.toml` with environment
//! variable overrides. Static checks run at load time; checks that need the
//! model (its trained context length) run when a session is constructed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.hearth/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the GGUF model file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    /// Generation loop settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Sampler settings
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Tool dispatch settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-session settings consumed read-only by the generation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Context size in tokens (0 = the model's trained context)
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,

    /// Maximum tokens decoded per batch
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,

    /// Tokens to predict (-1 = unlimited, -2 = until the context is full)
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,

    /// Prompt tokens kept on a window shift (-1 = the whole prompt)
    #[serde(default)]
    pub n_keep: i32,

    /// Self-extend group factor (1 = plain window shifting)
    #[serde(default = "default_grp_attn_n")]
    pub grp_attn_n: i32,

    /// Self-extend group width
    #[serde(default = "default_grp_attn_w")]
    pub grp_attn_w: i32,

    /// Shift the window when the context fills; when false a full context is fatal
    #[serde(default = "default_true")]
    pub ctx_shift: bool,

    /// Strings that hand control back to the caller
    #[serde(default)]
    pub antiprompts: Vec<String>,

    /// Strings that end a turn like anti-prompts but are never re-inserted
    /// into the context on end-of-generation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    #[serde(default)]
    pub input_prefix: String,

    #[serde(default)]
    pub input_suffix: String,

    /// Push BOS before each user input
    #[serde(default)]
    pub input_prefix_bos: bool,

    /// chatml, llama2, llama3 or zephyr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,

    /// Session cache file. Not locked: sessions running at the same time
    /// must not share a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_session: Option<PathBuf>,

    /// Load the session cache but never write it back
    #[serde(default)]
    pub prompt_cache_ro: bool,

    /// Initial (system) prompt
    #[serde(default)]
    pub prompt: String,

    /// Plain-text transcript replayed into new sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_transcript: Option<PathBuf>,

    #[serde(default)]
    pub interactive: bool,

    /// Wait for input before generating anything
    #[serde(default)]
    pub interactive_first: bool,

    /// Chat mode: format turns with the chat template
    #[serde(default)]
    pub conversation: bool,

    /// Process escape sequences (\n, \t, ...) in prompts and input
    #[serde(default = "default_true")]
    pub escape: bool,

    /// Render control tokens in output
    #[serde(default)]
    pub special: bool,
}

fn default_n_ctx() -> u32 {
    4096
}
fn default_n_batch() -> u32 {
    512
}
fn default_n_predict() -> i32 {
    -1
}
fn default_grp_attn_n() -> i32 {
    1
}
fn default_grp_attn_w() -> i32 {
    512
}
fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_predict: default_n_predict(),
            n_keep: 0,
            grp_attn_n: default_grp_attn_n(),
            grp_attn_w: default_grp_attn_w(),
            ctx_shift: true,
            antiprompts: vec![],
            stop_sequences: vec![],
            input_prefix: String::new(),
            input_suffix: String::new(),
            input_prefix_bos: false,
            chat_template: None,
            path_session: None,
            prompt_cache_ro: false,
            prompt: String::new(),
            prompt_transcript: None,
            interactive: false,
            interactive_first: false,
            conversation: false,
            escape: true,
            special: false,
        }
    }
}

impl SessionConfig {
    /// Whether the loop ever waits for caller input.
    pub fn is_interactive(&self) -> bool {
        self.interactive || self.interactive_first || self.conversation
    }

    /// Checks that need the model's trained context length.
    pub fn validate_for_model(&self, n_ctx: u32, n_ctx_train: u32) -> Result<(), ConfigError> {
        if self.grp_attn_n <= 1 {
            return Ok(());
        }
        let ga_w = self.grp_attn_w as u32;
        if n_ctx_train % ga_w != 0 {
            return Err(ConfigError::ValidationError(format!(
                "trained context ({n_ctx_train}) must be a multiple of grp_attn_w ({ga_w})"
            )));
        }
        let needed = n_ctx_train.saturating_mul(self.grp_attn_n as u32);
        if n_ctx < needed {
            return Err(ConfigError::ValidationError(format!(
                "n_ctx ({n_ctx}) must be at least n_ctx_train * grp_attn_n ({needed})"
            )));
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.n_batch == 0 {
            return Err(ConfigError::ValidationError("n_batch must be > 0".into()));
        }
        if self.n_ctx != 0 && self.n_ctx < 8 {
            return Err(ConfigError::ValidationError("n_ctx must be 0 or at least 8".into()));
        }
        if self.n_predict < -2 {
            return Err(ConfigError::ValidationError("n_predict must be >= -2".into()));
        }
        if self.n_keep < -1 {
            return Err(ConfigError::ValidationError("n_keep must be >= -1".into()));
        }
        if self.grp_attn_n < 1 {
            return Err(ConfigError::ValidationError("grp_attn_n must be >= 1".into()));
        }
        if self.grp_attn_n > 1 {
            if self.grp_attn_w <= 0 {
                return Err(ConfigError::ValidationError("grp_attn_w must be > 0".into()));
            }
            if self.grp_attn_w % self.grp_attn_n != 0 {
                return Err(ConfigError::ValidationError(
                    "grp_attn_w must be a multiple of grp_attn_n".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Sampler settings. Consumed by the backend, one chain per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_seed")]
    pub seed: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_min_p")]
    pub min_p: f32,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,

    /// GBNF grammar constraining generated tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
}

fn default_seed() -> u32 {
    1234
}
fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_min_p() -> f32 {
    0.05
}
fn default_repeat_penalty() -> f32 {
    1.0
}
fn default_repeat_last_n() -> i32 {
    64
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            grammar: None,
        }
    }
}

/// What to do when the model emits a tool call that cannot be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallPolicy {
    /// Feed an error envelope back to the model and keep going.
    #[default]
    Recover,
    /// Fail the inference call.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool dispatch rounds per inference call
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Handling of malformed tool calls and unknown tool names
    #[serde(default)]
    pub malformed_tool_calls: ToolCallPolicy,
}

fn default_max_tool_iterations() -> u32 {
    25
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            malformed_tool_calls: ToolCallPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.hearth/config.toml).
    ///
    /// Environment overrides:
    /// - `HEARTH_MODEL`: model path
    /// - `HEARTH_CTX_SIZE`: context size
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(model) = std::env::var("HEARTH_MODEL") {
            config.model_path = Some(PathBuf::from(model));
        }

        if let Ok(ctx) = std::env::var("HEARTH_CTX_SIZE") {
            config.session.n_ctx = ctx.parse().map_err(|_| {
                ConfigError::ValidationError(format!("HEARTH_CTX_SIZE is not a number: {ctx}"))
            })?;
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
        dirs_home().join(".hearth")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;

        if self.sampling.temperature < 0.0 || self.sampling.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_tool_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_tool_iterations must be >= 1".into(),
            ));
        }

        Ok(())
    }

    /// The model path, or a configuration error when none is set.
    pub fn require_model_path(&self) -> Result<&Path, ConfigError> {
        self.model_path.as_deref().ok_or_else(|| {
            ConfigError::ValidationError(
                "no model configured (set model_path or HEARTH_MODEL)".into(),
            )
        })
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            session: SessionConfig::default(),
            sampling: SamplingConfig::default(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
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

impl From<ConfigError> for hearth_core::Error {
    fn from(err: ConfigError) -> Self {
        hearth_core::Error::config(err.to_string())
    }
}
