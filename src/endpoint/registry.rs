//! Process-wide endpoint registry
//!
//! Maps each resolved address to one shared backend. Concurrent resolutions
//! of the same address wait on a single open; a failed open leaves the slot
//! empty so the next caller tries again.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{AddressDefaults, Endpoint, EndpointAddress};
use crate::backend::{Backend, BackendFactory, BackendKind, OpenMode, StorageBackend};
use crate::config::ServerConfig;
use crate::error::ResolutionError;

type Slot = Arc<OnceCell<Arc<Backend>>>;

/// Open backend listed by [`EndpointRegistry::entries`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub key: String,
    pub kind: BackendKind,
}

/// Resolves endpoint tokens to shared backend handles
pub struct EndpointRegistry {
    factory: BackendFactory,
    defaults: AddressDefaults,
    slots: DashMap<String, Slot>,
}

impl EndpointRegistry {
    pub fn new(factory: BackendFactory, defaults: AddressDefaults) -> Self {
        Self {
            factory,
            defaults,
            slots: DashMap::new(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(BackendFactory::from_config(config), config.address_defaults())
    }

    /// Parse a token with this registry's defaults
    pub fn parse(&self, token: &str) -> Result<EndpointAddress, ResolutionError> {
        EndpointAddress::parse(token, &self.defaults)
    }

    /// Resolve one token, opening its backend at most once per process
    pub async fn resolve(&self, token: &str, mode: OpenMode) -> Result<Endpoint, ResolutionError> {
        let address = self.parse(token)?;
        let key = self.key_for(&address);

        let slot = self.slots.entry(key.clone()).or_default().clone();

        let backend = slot
            .get_or_try_init(|| async {
                let backend = self.factory.open(&address, mode).await?;
                info!("Opened {} endpoint {}", backend.kind(), address);
                Ok::<_, ResolutionError>(Arc::new(backend))
            })
            .await
            .map_err(|e| {
                debug!("Resolving {} failed: {}", key, e);
                e
            })?
            .clone();

        Ok(Endpoint::new(address, backend))
    }

    /// Resolve every token, failing if any of them fails
    pub async fn resolve_all(
        &self,
        tokens: &[String],
        mode: OpenMode,
    ) -> Result<Vec<Endpoint>, ResolutionError> {
        let resolved =
            futures::future::join_all(tokens.iter().map(|token| self.resolve(token, mode))).await;

        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(resolved.len());
        for result in resolved {
            let endpoint = result?;
            if !endpoints.iter().any(|e| e.address == endpoint.address) {
                endpoints.push(endpoint);
            }
        }
        Ok(endpoints)
    }

    /// Backends opened so far, sorted by key
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .slots
            .iter()
            .filter_map(|slot| {
                slot.value().get().map(|backend| RegistryEntry {
                    key: slot.key().clone(),
                    kind: backend.kind(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Close every open backend and forget them
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        for key in keys {
            let Some((key, slot)) = self.slots.remove(&key) else {
                continue;
            };
            if let Some(backend) = slot.get() {
                if let Err(e) = backend.close().await {
                    warn!("Failed to close {}: {}", key, e);
                }
            }
        }
    }

    /// Local databases are keyed by their directory so that `name` and
    /// `file://<data_dir>/name` share one handle
    fn key_for(&self, address: &EndpointAddress) -> String {
        match address.local_path(self.factory.data_dir()) {
            Some(path) => format!("file://{}", path.display()),
            None => address.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RemoteSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn registry(data_dir: &std::path::Path) -> EndpointRegistry {
        EndpointRegistry::new(
            BackendFactory::new(data_dir, RemoteSettings::default()),
            AddressDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_using_missing_then_create() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(temp_dir.path());

        let missing = registry.resolve("books", OpenMode::Open).await;
        assert!(matches!(missing, Err(ResolutionError::NoSuchDatabase(_))));
        assert!(registry.entries().is_empty());

        let created = registry.resolve("books", OpenMode::Create).await.unwrap();
        let reused = registry.resolve("./books/", OpenMode::Open).await.unwrap();
        assert!(Arc::ptr_eq(&created.backend, &reused.backend));
        assert_eq!(registry.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_file_path_shares_local_handle() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(temp_dir.path());

        let by_name = registry.resolve("books", OpenMode::Create).await.unwrap();
        let by_path = registry
            .resolve(
                &format!("file://{}", temp_dir.path().join("books").display()),
                OpenMode::Open,
            )
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&by_name.backend, &by_path.backend));
    }

    #[tokio::test]
    async fn test_resolve_all_deduplicates() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(temp_dir.path());

        let tokens = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let endpoints = registry.resolve_all(&tokens, OpenMode::Create).await.unwrap();
        let names: Vec<String> = endpoints.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_concurrent_remote_resolution_connects_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));

        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    // Slow greeting widens the window for duplicate opens
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    write_half.write_all(b"# fake peer\n").await.unwrap();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(_)) = lines.next_line().await {
                        if write_half.write_all(b">> OK\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let temp_dir = TempDir::new().unwrap();
        let registry = Arc::new(registry(temp_dir.path()));
        let token = format!("lindex://127.0.0.1:{}/db", port);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                registry.resolve(&token, OpenMode::Create).await.unwrap()
            }));
        }

        let mut endpoints = Vec::new();
        for task in tasks {
            endpoints.push(task.await.unwrap());
        }

        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        for endpoint in &endpoints[1..] {
            assert!(Arc::ptr_eq(&endpoints[0].backend, &endpoint.backend));
        }
        assert_eq!(registry.entries()[0].kind, BackendKind::Remote);
    }

    #[tokio::test]
    async fn test_unreachable_is_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let temp_dir = TempDir::new().unwrap();
        let registry = registry(temp_dir.path());
        let token = format!("127.0.0.1:{}/db", port);

        let first = registry.resolve(&token, OpenMode::Create).await;
        assert!(matches!(
            first,
            Err(ResolutionError::EndpointUnreachable { .. })
        ));

        // Bring a peer up on the same port; the failed slot must not stick
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    write_half.write_all(b"# up\n").await.unwrap();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(_)) = lines.next_line().await {
                        if write_half.write_all(b">> OK\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        assert!(registry.resolve(&token, OpenMode::Create).await.is_ok());
    }
}
