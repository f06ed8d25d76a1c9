use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// System prompt sent ahead of every conversation.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Number of prior messages included in each generation request.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Delay between words when a backend's reply is replayed as a typing
    /// effect (remote API, shortcut handshake).
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub on_device: OnDeviceConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,
}

// -- Sampling ----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

// -- Web search --------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Augment prompts with web search results before generation.
    #[serde(default)]
    pub enabled: bool,

    /// Perplexity API key.  Can be overridden with `PERPLEXITY_API_KEY`.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_search_base_url")]
    pub base_url: String,

    #[serde(default = "default_search_max_results")]
    pub max_results: usize,

    /// How many of the top results get their page text fetched.
    #[serde(default = "default_fetch_top")]
    pub fetch_top: usize,

    #[serde(default = "default_network_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

// -- On-device model ---------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OnDeviceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ollama daemon address.  Can be overridden with `OLLAMA_HOST`.
    #[serde(default = "default_ollama_host")]
    pub host: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,

    #[serde(default = "default_network_timeout_secs")]
    pub timeout_secs: u64,
}

// -- Remote API --------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Gemini API key.  Can be overridden with `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    #[serde(default = "default_gemini_model")]
    pub model: String,

    #[serde(default = "default_network_timeout_secs")]
    pub timeout_secs: u64,
}

// -- Local runtime -----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Prefer the embedded runtime when a model is configured.
    #[serde(default)]
    pub enabled: bool,

    /// Model weights path.  Can be overridden with `MODEL_PATH`.
    #[serde(default)]
    pub model_path: String,

    /// "gemma3-1b-q4" or "qwen-4b-q4".
    #[serde(default = "default_model_type")]
    pub model_type: String,

    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Load the model at startup.  Otherwise it is loaded by the first
    /// generation routed to the embedded runtime.
    #[serde(default)]
    pub load_on_start: bool,
}

// -- Shortcut handshake ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Rendezvous folder watched by the automation tool.  Empty means the
    /// command-line fallback is used.
    #[serde(default)]
    pub shared_dir: String,

    #[serde(default = "default_shortcut_name")]
    pub shortcut_name: String,

    #[serde(default = "default_shortcuts_bin")]
    pub cli_bin: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub timeout_secs: u64,
}

// -- Defaults ----------------------------------------------------------------

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}
fn default_history_window() -> usize {
    10
}
fn default_typing_delay_ms() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_k() -> u32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_max_tokens() -> u32 {
    512
}
fn default_true() -> bool {
    true
}
fn default_search_base_url() -> String {
    "https://api.perplexity.ai".to_string()
}
fn default_search_max_results() -> usize {
    5
}
fn default_fetch_top() -> usize {
    3
}
fn default_network_timeout_secs() -> u64 {
    30
}
fn default_fetch_timeout_secs() -> u64 {
    15
}
fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3.2:1b".to_string()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_model_type() -> String {
    "gemma3-1b-q4".to_string()
}
fn default_context_size() -> u32 {
    2048
}
fn default_shortcut_name() -> String {
    "Ask Parley".to_string()
}
fn default_shortcuts_bin() -> String {
    "shortcuts".to_string()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_handshake_timeout_secs() -> u64 {
    60
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            base_url: default_search_base_url(),
            max_results: default_search_max_results(),
            fetch_top: default_fetch_top(),
            timeout_secs: default_network_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for OnDeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_ollama_host(),
            model: default_ollama_model(),
            timeout_secs: default_network_timeout_secs(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_gemini_base_url(),
            model: default_gemini_model(),
            timeout_secs: default_network_timeout_secs(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: String::new(),
            model_type: default_model_type(),
            context_size: default_context_size(),
            load_on_start: false,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shared_dir: String::new(),
            shortcut_name: default_shortcut_name(),
            cli_bin: default_shortcuts_bin(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            history_window: default_history_window(),
            typing_delay_ms: default_typing_delay_ms(),
            sampling: SamplingConfig::default(),
            search: SearchConfig::default(),
            on_device: OnDeviceConfig::default(),
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

// -- Config impl ---------------------------------------------------------

impl Config {
    /// Load config from the given path, or the default XDG config location,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let mut config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path).map_err(ParleyError::Io)?;
            toml::from_str(&contents)
                .map_err(|e| ParleyError::Config(format!("parse error: {e}")))?
        } else {
            info!("no config file found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Secrets and host addresses may come from the environment (or `.env`).
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = env_non_empty("GEMINI_API_KEY") {
            self.remote.api_key = key;
        }
        if let Some(key) = env_non_empty("PERPLEXITY_API_KEY") {
            self.search.api_key = key;
        }
        if let Some(host) = env_non_empty("OLLAMA_HOST") {
            self.on_device.host = host;
        }
        if let Some(path) = env_non_empty("MODEL_PATH") {
            self.local.model_path = path;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.handshake.poll_interval_ms == 0 {
            return Err(ParleyError::Config(
                "handshake.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.local.enabled && self.local.model_path.is_empty() {
            return Err(ParleyError::Config(
                "local runtime enabled but no model path: set `local.model_path` \
                 or the `MODEL_PATH` environment variable"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/parley/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("parley")
            .join("config.toml")
    }

    /// Returns the data directory: `$XDG_DATA_HOME/parley/`
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("parley")
    }

    /// Generate the default config file contents.
    pub fn default_config_contents() -> &'static str {
        include_str!("../config.example.toml")
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
