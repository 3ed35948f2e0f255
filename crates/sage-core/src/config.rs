use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SageError};

/// Top-level configuration for Sage.
///
/// Loaded from `~/.sage/config.toml` by default, then patched from the
/// environment (see [`SageConfig::apply_env`]). Each section corresponds to
/// one remote collaborator or surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SageConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
}

impl SageConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SageConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Empty values are ignored so that `LLM_API_KEY=` does not wipe a key
    /// set in the config file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LLM_API_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("LLM_CHAT_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_JSON_SCHEMA") {
            self.llm.json_schema = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = get("LLM_WIRE_FORMAT") {
            match v.trim().to_ascii_lowercase().as_str() {
                "auto" => self.llm.wire_format = WireFormatSetting::Auto,
                "openai" => self.llm.wire_format = WireFormatSetting::OpenAi,
                "gemini" => self.llm.wire_format = WireFormatSetting::Gemini,
                other => warn!(value = %other, "Ignoring unknown LLM_WIRE_FORMAT"),
            }
        }
        if let Some(v) = get("SEARXNG_URL") {
            self.search.base_url = v;
        }
        if let Some(v) = get("TELEGRAM_TOKEN") {
            self.telegram.token = Some(v);
        }
        if let Some(v) = get("SAGE_PORT") {
            match v.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %v, "Ignoring invalid SAGE_PORT"),
            }
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log filter (`trace` .. `error`, or an `EnvFilter` directive). When
    /// unset the binary picks a default per subcommand.
    pub log_level: Option<String>,
    /// Inquiries longer than this are rejected before reaching the pipeline.
    pub max_inquiry_chars: usize,
    /// Number of most recent turns a conversation keeps.
    pub history_turns: usize,
    /// Conversations kept in memory; the least recently used idle one is
    /// evicted beyond this.
    pub max_conversations: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            max_inquiry_chars: 2000,
            history_turns: 20,
            max_conversations: 1024,
        }
    }
}

/// Which completion wire format to speak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormatSetting {
    /// Pick from the base URL.
    #[default]
    Auto,
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

/// Completion backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL, e.g. `http://127.0.0.1:8080/v1`.
    pub base_url: String,
    /// Bearer token (OpenAI) or API key (Gemini).
    pub api_key: Option<String>,
    /// Model name sent with every request.
    pub model: String,
    pub wire_format: WireFormatSetting,
    /// Deadline, in seconds, for the backend to start answering.
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    /// Ask the backend for JSON-schema constrained output.
    pub json_schema: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            api_key: None,
            model: "default".to_string(),
            wire_format: WireFormatSetting::Auto,
            timeout_secs: 17,
            max_tokens: 400,
            temperature: 0.0,
            stop: vec!["<|im_end|>".to_string(), "<|end|>".to_string()],
            json_schema: false,
        }
    }
}

/// SearXNG search backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub categories: String,
    pub engines: String,
    /// SearXNG safesearch level: 0 (off), 1 (moderate), 2 (strict).
    pub safesearch: u8,
    /// Number of references kept after filtering.
    pub top_k: usize,
    /// Snippets are cut to at most this many characters.
    pub snippet_max_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            timeout_secs: 31,
            categories: "general".to_string(),
            engines: "bing,brave,duckduckgo,google,qwant".to_string(),
            safesearch: 0,
            top_k: 3,
            snippet_max_chars: 300,
        }
    }
}

/// Bounded retry settings shared by the completion and search calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * backoff_ms` before the next try.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1500,
        }
    }
}

/// HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

/// Telegram poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: Option<String>,
    pub api_base: String,
    /// Per-request timeout for `getUpdates`/`sendMessage`.
    pub timeout_secs: u64,
    /// Pause between polls when the previous poll failed.
    pub poll_interval_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: "https://api.telegram.org".to_string(),
            timeout_secs: 5,
            poll_interval_secs: 1,
        }
    }
}

/// External speech programs. Both are optional; when unset, speech I/O is
/// simply unavailable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Program and leading arguments; the text and language code are appended.
    pub speak_command: Vec<String>,
    /// Program and arguments; each stdout line is one transcript.
    pub listen_command: Vec<String>,
}
