//! Client settings.
//!
//! Loaded from a JSON settings file; every field is optional and falls
//! back to [`ClientConfig::default`].
//!
//! ```json
//! { "serverURL": "ws://localhost:8000", "username": "ada", "lock_timeout_secs": 5 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server
    #[serde(alias = "serverURL")]
    pub server_url: String,
    /// Name shown to other users and stamped on pieces we lock
    pub username: String,
    /// Seconds to wait for a content response
    pub request_timeout_secs: u64,
    /// Seconds to wait for a lock response
    pub lock_timeout_secs: u64,
    /// Transport event channel capacity
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            username: "anonymous".to_string(),
            request_timeout_secs: 10,
            lock_timeout_secs: 10,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Read settings from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides and check the result.
    pub fn with_overrides(
        mut self,
        username: Option<String>,
        server_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(username) = username {
            self.username = username;
        }
        if let Some(server_url) = server_url {
            self.server_url = server_url;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("username must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "server_url must be a ws:// or wss:// URL, got {}",
                self.server_url
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cannot read settings: {0}")]
    Io(String),
    #[error("Malformed settings: {0}")]
    Parse(String),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}
