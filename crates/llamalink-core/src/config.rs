//! Persisted proxy configuration.
//!
//! The config file is a small JSON document (`config.json` by default) with
//! the fields `port`, `ollama_base_url` and `timeout`. Loading merges the
//! file over the defaults so a partial file keeps working, and a missing file
//! is created with the defaults on first run.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Default port for the OpenAI-compatible listener.
pub const DEFAULT_PORT: u16 = 8000;

/// Default base URL of the Ollama server being proxied.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Default upstream request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Active proxy configuration.
///
/// A `Config` value is immutable once handed to a running server instance;
/// the supervisor replaces it atomically and restarts the listener. Unknown
/// keys in the file (the tray UI stores a few of its own) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port the proxy listens on.
    pub port: u16,

    /// Base URL of the upstream Ollama server.
    pub ollama_base_url: Url,

    /// Upstream request timeout in seconds. For streaming responses this
    /// bounds the inactivity period between chunks, not the whole stream.
    pub timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ollama_base_url: Url::parse(DEFAULT_OLLAMA_BASE_URL)
                .expect("default base URL is valid"),
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(ConfigError::InvalidTimeout(self.timeout));
        }
        match self.ollama_base_url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        Ok(())
    }

    /// The upstream timeout as a [`Duration`].
    ///
    /// Only meaningful on a validated config (`timeout` finite and positive).
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Load the configuration from `path`.
    ///
    /// Never fails: a missing file is created with the defaults, and an
    /// unreadable, unparsable or invalid file logs a warning and falls back
    /// to the defaults. Fields absent from the file keep their default value.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("Failed to write default config to {}: {e}", path.display());
            }
            return config;
        }

        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read config {}: {e}; using defaults", path.display());
                return Self::default();
            }
        };

        let config: Self = match serde_json::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse config {}: {e}; using defaults", path.display());
                return Self::default();
            }
        };

        if let Err(e) = config.validate() {
            warn!("Invalid config {}: {e}; using defaults", path.display());
            return Self::default();
        }

        config
    }

    /// Save the configuration to `path` as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Configuration validation or persistence error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("Upstream base URL must be http or https, got {0}")]
    UnsupportedScheme(String),

    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}
