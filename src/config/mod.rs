//! Configuration for lindex

mod logging;
mod query;
mod server;

pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use query::QueryConfig;
pub use server::ServerConfig;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener, storage and fan-out settings
    #[serde(default)]
    pub server: ServerConfig,
    /// SEARCH paging limits
    #[serde(default)]
    pub query: QueryConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write config file '{}': {}", path.display(), e))?;
        Ok(())
    }

    /// Validate all configuration fields.
    ///
    /// Collects every problem and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Server validation
        if self.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "listen_addr must be a socket address, got {:?}",
                self.server.listen_addr
            ));
        }
        if self.server.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }
        if self.server.default_remote_port == 0 {
            errors.push("default_remote_port must be positive".to_string());
        }
        if self.server.default_database.is_empty() {
            errors.push("default_database must not be empty".to_string());
        }
        if self.server.command_timeout_ms == 0 {
            errors.push("command_timeout_ms must be positive".to_string());
        }
        if self.server.connect_timeout_ms == 0 {
            errors.push("connect_timeout_ms must be positive".to_string());
        }
        if self.server.max_line_bytes < 1024 {
            errors.push("max_line_bytes must be at least 1024".to_string());
        }

        // Query validation
        if self.query.max_limit == 0 {
            errors.push("max_limit must be positive".to_string());
        }
        if self.query.default_limit > self.query.max_limit {
            errors.push(format!(
                "default_limit ({}) must not exceed max_limit ({})",
                self.query.default_limit, self.query.max_limit
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}
