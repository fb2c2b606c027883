//! Backend construction from endpoint addresses

use std::path::PathBuf;

use tracing::debug;

use super::{Backend, LocalBackend, OpenMode, RemoteBackend, RemoteSettings};
use crate::config::ServerConfig;
use crate::endpoint::EndpointAddress;
use crate::error::ResolutionError;

/// Opens local databases under a data directory and connects to peers
#[derive(Debug, Clone)]
pub struct BackendFactory {
    data_dir: PathBuf,
    remote: RemoteSettings,
}

impl BackendFactory {
    pub fn new(data_dir: impl Into<PathBuf>, remote: RemoteSettings) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.data_dir.clone(),
            RemoteSettings {
                connect_timeout: config.connect_timeout(),
                pool_size: config.remote_pool_size,
            },
        )
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    /// Open the backend behind an address
    pub async fn open(
        &self,
        address: &EndpointAddress,
        mode: OpenMode,
    ) -> Result<Backend, ResolutionError> {
        debug!("Opening {} ({:?})", address, mode);
        match address {
            EndpointAddress::Remote(remote) => {
                RemoteBackend::connect(remote.clone(), mode, self.remote.clone())
                    .await
                    .map(Backend::Remote)
            }
            local => {
                let path = local
                    .local_path(&self.data_dir)
                    .ok_or_else(|| ResolutionError::InvalidEndpoint {
                        endpoint: local.to_string(),
                        reason: "not a local address".to_string(),
                    })?;
                let endpoint = local.to_string();
                tokio::task::spawn_blocking(move || LocalBackend::open(path, mode))
                    .await
                    .map_err(|e| ResolutionError::EndpointUnreachable {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    })?
                    .map(Backend::Local)
                    .map_err(|e| match e {
                        ResolutionError::NoSuchDatabase(_) => {
                            ResolutionError::NoSuchDatabase(endpoint)
                        }
                        other => other,
                    })
            }
        }
    }
}
