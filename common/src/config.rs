use serde::Deserialize;
use std::path::Path;

/// Environment variables consulted, in order, when `gemini.api_key` is unset.
pub const API_KEY_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub chroma: ChromaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    /// Upper bound for one generate-and-key round trip.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prefer the environment for secrets; this is mostly for local testing.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Raw chroma-key thresholds as written in the file.
///
/// Kept as wide integers so that out-of-range values reach the filter's
/// validation instead of failing as an opaque TOML type error.
#[derive(Debug, Clone, Deserialize)]
pub struct ChromaConfig {
    #[serde(default = "default_green_threshold")]
    pub green_threshold: i64,
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_gemini_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            green_threshold: default_green_threshold(),
            diff_threshold: default_diff_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads `path` if it exists, otherwise falls back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

impl GeminiConfig {
    /// Resolves the API key from the config file, then the environment.
    /// Blank values count as missing.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .into_iter()
            .chain(API_KEY_ENV_VARS.iter().filter_map(|var| std::env::var(var).ok()))
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_static_dir() -> String {
    "api/static".into()
}
fn default_request_timeout() -> u64 {
    120
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_model() -> String {
    "gemini-2.5-flash-image".into()
}
fn default_gemini_timeout() -> u64 {
    90
}
fn default_max_retries() -> u32 {
    1
}
fn default_green_threshold() -> i64 {
    120
}
fn default_diff_threshold() -> i64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
