//! Configuration management for weft
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the caller)
//! 2. Environment variables (`WEFT_*` prefix, `__` between section and key)
//! 3. weft.local.toml (gitignored, local overrides)
//! 4. weft.toml (git-tracked, project config)
//! 5. ~/.config/weft/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main weft configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub server: ServerSection,
    pub logging: LoggingSection,
}

/// `[server]`: listener, framing and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_address: String,
    pub delimiter: String,
    pub buffer_capacity: usize,
    pub pool_size: usize,
    pub max_frame_size: usize,
    pub poll_interval_ms: u64,
    pub accept_backoff_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7000".to_string(),
            delimiter: "\r\n".to_string(),
            buffer_capacity: 1024,
            pool_size: 128,
            max_frame_size: 16 * 1024 * 1024,
            poll_interval_ms: 500,
            accept_backoff_ms: 1000,
            write_timeout_ms: 5000,
        }
    }
}

impl ServerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl WeftConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Check values that would only fail later, at server start
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.delimiter.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "server.delimiter",
                reason: "must not be empty".to_string(),
            });
        }

        for (field, value) in [
            ("server.buffer_capacity", server.buffer_capacity),
            ("server.pool_size", server.pool_size),
            ("server.max_frame_size", server.max_frame_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError {
                    field,
                    reason: "must be positive".to_string(),
                });
            }
        }

        if server.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError {
                field: "server.poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}
