//! Server and endpoint configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::daemon::protocol::DEFAULT_MAX_LINE_BYTES;
use crate::endpoint::AddressDefaults;

/// Listener, storage and fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the line protocol listens on
    pub listen_addr: String,
    /// Root directory for local databases
    pub data_dir: PathBuf,
    /// Port used for remote endpoints written without one
    pub default_remote_port: u16,
    /// Database used for remote endpoints written without one
    pub default_database: String,
    /// Deadline for one command's whole fan-out
    pub command_timeout_ms: u64,
    /// Deadline for connecting to a peer
    pub connect_timeout_ms: u64,
    /// Longest accepted request line
    pub max_line_bytes: usize,
    /// Idle connections kept per remote endpoint
    pub remote_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8890".to_string(),
            data_dir: directories::ProjectDirs::from("", "", "lindex")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".lindex")),
            default_remote_port: 33333,
            default_database: "default".to_string(),
            command_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            remote_pool_size: 4,
        }
    }
}

impl ServerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Defaults for partially written remote addresses
    pub fn address_defaults(&self) -> AddressDefaults {
        AddressDefaults {
            remote_port: self.default_remote_port,
            database: self.default_database.clone(),
        }
    }
}
