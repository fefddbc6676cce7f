//! # Configuration
//!
//! Optional TOML file plus environment overrides.
//!
//! ```toml
//! [session]
//! socket_path = "/tmp/amba-ipc.socket"
//!
//! [session.bridge]
//! poll_interval_ms = 200
//! receive_timeout_ms = 200
//!
//! [logging]
//! format = "json"
//! filter = "amba=debug"
//! ```
//!
//! Missing keys fall back to their defaults. `AMBA_SOCKET` overrides the
//! socket path and `AMBA_LOG_FORMAT` the log format; `RUST_LOG`, when set,
//! replaces the configured filter at subscriber setup.

use amba_core::{AmbaError, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Socket path override.
pub const ENV_SOCKET: &str = "AMBA_SOCKET";

/// Log format override (`json` or `text`).
pub const ENV_LOG_FORMAT: &str = "AMBA_LOG_FORMAT";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything but `json` is text.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "amba=info".to_string(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine-side session settings.
    pub session: SessionConfig,
    /// Subscriber settings.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load the file at `path` (defaults when `None`), then apply the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, AmbaError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, AmbaError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            AmbaError::ConfigError(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(AmbaError::ConfigError(format!(
                "'{}' is {} bytes, maximum is {}",
                path.display(),
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AmbaError::ConfigError(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse TOML text.
    pub fn from_toml(content: &str) -> Result<Self, AmbaError> {
        toml::from_str(content).map_err(|e| AmbaError::ConfigError(e.to_string()))
    }

    /// Apply overrides looked up by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|s| !s.is_empty()) {
            self.session.socket_path = PathBuf::from(socket);
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = LogFormat::from_name(&format);
        }
    }
}
