// Local configuration for a collaboration endpoint.
//
// Global config: `~/.tandem/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::negotiation::hooks::TransferType;

/// Root directory for tandem global state: `~/.tandem/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tandem"))
}

/// Path to the global config file: `~/.tandem/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Human-readable name used in session offers.
    pub display_name: Option<String>,
    /// Preferred highlight color, sent to the host when joining.
    pub favorite_color: i32,
    /// Upper bound for acquiring the session slot on start or stop.
    pub lock_timeout_ms: u64,
    /// How long a stop waits for running negotiations to wind down.
    pub stop_timeout_ms: u64,
    /// How long the inviting side waits for a session offer to be acknowledged.
    pub ack_timeout_ms: u64,
    /// How long either side waits for any other negotiation message.
    pub response_timeout_ms: u64,
    /// Preferred way of shipping resource content.
    pub transfer_type: TransferType,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            favorite_color: 0,
            lock_timeout_ms: 10_000,
            stop_timeout_ms: 10_000,
            ack_timeout_ms: 30_000,
            response_timeout_ms: 60_000,
            transfer_type: TransferType::Archive,
        }
    }
}

impl SessionConfig {
    /// Load from `~/.tandem/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to `~/.tandem/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
