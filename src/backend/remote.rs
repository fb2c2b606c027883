//! Peer server adapter
//!
//! Forwards operations to another lindex server over the line protocol.
//! Each pooled connection is bound to the remote database with `CREATE` or
//! `USING` when it is opened. A request that fails on a broken connection
//! is retried once on a fresh one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::{BackendKind, StorageBackend};
use super::OpenMode;
use crate::client::{Client, ClientError, Reply, SearchReply};
use crate::daemon::protocol::Status;
use crate::endpoint::RemoteAddress;
use crate::error::{BackendError, BackendResult, ResolutionError};
use crate::query::Query;
use crate::types::{BackendResults, Document, FacetCounts};

/// Connection settings shared by every remote endpoint
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub connect_timeout: Duration,
    /// Idle connections kept per endpoint
    pub pool_size: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            pool_size: 4,
        }
    }
}

/// `COUNT` payload line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountLine {
    pub count: u64,
}

/// `DELETE` payload line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteLine {
    pub id: String,
    /// Number of endpoints that held the document
    pub deleted: usize,
}

/// Database hosted by a peer server
pub struct RemoteBackend {
    address: RemoteAddress,
    mode: OpenMode,
    settings: RemoteSettings,
    idle: Mutex<Vec<Client>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("address", &self.address.to_string())
            .field("mode", &self.mode)
            .finish()
    }
}

impl RemoteBackend {
    /// Connect to the peer and bind the first connection to the database
    pub async fn connect(
        address: RemoteAddress,
        mode: OpenMode,
        settings: RemoteSettings,
    ) -> Result<Self, ResolutionError> {
        let backend = Self {
            address,
            mode,
            settings,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let client = backend.open_connection().await.map_err(|e| match e {
            ClientError::Server { code: 404, .. } => {
                ResolutionError::NoSuchDatabase(backend.address.to_string())
            }
            other => ResolutionError::EndpointUnreachable {
                endpoint: backend.address.to_string(),
                reason: other.to_string(),
            },
        })?;
        backend.release(client);

        debug!("Connected to remote endpoint {}", backend.address);
        Ok(backend)
    }

    /// Number of idle pooled connections
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    async fn open_connection(&self) -> Result<Client, ClientError> {
        let mut client =
            Client::connect_timeout(self.address.socket_addr(), self.settings.connect_timeout)
                .await?;
        let verb = match self.mode {
            OpenMode::Create => "CREATE",
            OpenMode::Open => "USING",
        };
        client
            .send(&format!("{} {}", verb, self.address.database))
            .await?
            .into_result()?;
        Ok(client)
    }

    fn release(&self, client: Client) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.settings.pool_size {
            idle.push(client);
        }
    }

    /// Send one command, retrying once if a pooled connection turns out to
    /// be dead
    async fn request(&self, line: &str) -> BackendResult<Reply> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }

        let pooled = self.idle.lock().pop();
        let reused = pooled.is_some();
        let mut client = match pooled {
            Some(client) => client,
            None => self.open_connection().await.map_err(remote_error)?,
        };

        let reply = match exchange(&mut client, line).await {
            Ok(reply) => reply,
            Err(e) if reused && e.is_connection_error() => {
                debug!("Stale connection to {} ({}), reconnecting", self.address, e);
                client = self.open_connection().await.map_err(remote_error)?;
                exchange(&mut client, line).await.map_err(remote_error)?
            }
            Err(e) => return Err(remote_error(e)),
        };

        self.release(client);

        match reply.status {
            Status::Error { code, message } => {
                Err(BackendError::Remote(format!("[{}] {}", code, message)))
            }
            _ => Ok(reply),
        }
    }
}

/// One request on one connection. A peer that says goodbye instead of
/// answering has closed the connection.
async fn exchange(client: &mut Client, line: &str) -> Result<Reply, ClientError> {
    let reply = client.send(line).await?;
    if reply.status == Status::Bye {
        return Err(ClientError::Closed);
    }
    Ok(reply)
}

fn remote_error(e: ClientError) -> BackendError {
    BackendError::Remote(e.to_string())
}

fn first_json<T: serde::de::DeserializeOwned>(reply: &Reply) -> BackendResult<T> {
    let line = reply
        .lines
        .first()
        .ok_or_else(|| BackendError::Remote("empty response".to_string()))?;
    serde_json::from_str(line).map_err(|e| BackendError::Remote(format!("{}: {}", e, line)))
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn index(&self, document: &Document) -> BackendResult<()> {
        let payload = serde_json::to_string(document)?;
        self.request(&format!("INDEX {}", payload)).await?;
        Ok(())
    }

    async fn search(&self, query: &Query) -> BackendResult<BackendResults> {
        let payload = serde_json::to_string(query)?;
        let reply = self.request(&format!("SEARCH {}", payload)).await?;
        let parsed = SearchReply::from_reply(&reply).map_err(remote_error)?;

        for warning in &parsed.warnings {
            warn!("{}: {}", self.address, warning);
        }

        let mut facets: FacetCounts = FacetCounts::new();
        for line in parsed.facets {
            *facets
                .entry(line.facet)
                .or_default()
                .entry(line.term)
                .or_insert(0) += line.termfreq;
        }

        Ok(BackendResults {
            hits: parsed.hits,
            total: parsed.summary.estimated,
            facets,
            partial: parsed.summary.partial || !parsed.summary.failures.is_empty(),
        })
    }

    async fn count(&self, query: &Query) -> BackendResult<u64> {
        let payload = serde_json::to_string(query)?;
        let reply = self.request(&format!("COUNT {}", payload)).await?;
        Ok(first_json::<CountLine>(&reply)?.count)
    }

    async fn delete(&self, id: &str) -> BackendResult<bool> {
        let reply = self.request(&format!("DELETE {}", id)).await?;
        Ok(first_json::<DeleteLine>(&reply)?.deleted > 0)
    }

    async fn commit(&self) -> BackendResult<()> {
        self.request("COMMIT").await?;
        Ok(())
    }

    async fn reopen(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        let dropped = std::mem::take(&mut *self.idle.lock()).len();
        debug!("Dropped {} idle connections to {}", dropped, self.address);
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let connections: Vec<Client> = std::mem::take(&mut *self.idle.lock());
        for mut client in connections {
            if let Err(e) = client.send("QUIT").await {
                debug!("Ignoring error closing connection to {}: {}", self.address, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Peer that greets, answers 404 to USING and OK to everything else
    async fn fake_peer() -> (RemoteAddress, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    write_half.write_all(b"# fake\n").await.unwrap();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply: &[u8] = if line.starts_with("USING") {
                            b">> ERR: [404] No such database: x\n"
                        } else if line.starts_with("COUNT") {
                            b"{\"count\":7}\n>> OK\n"
                        } else {
                            b">> OK\n"
                        };
                        if write_half.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let address = RemoteAddress {
            scheme: "lindex".into(),
            host: "127.0.0.1".into(),
            port,
            database: "db".into(),
        };
        (address, handle)
    }

    /// Peer that binds every connection, then answers each later command
    /// on the first `bye_connections` connections with BYE
    async fn closing_peer(bye_connections: usize) -> RemoteAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut accepted = 0;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let says_bye = accepted < bye_connections;
                accepted += 1;
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    write_half.write_all(b"# fake\n").await.unwrap();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if says_bye && !line.starts_with("CREATE") {
                            let _ = write_half.write_all(b">> BYE!\n").await;
                            break;
                        }
                        if write_half.write_all(b">> OK\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        RemoteAddress {
            scheme: "lindex".into(),
            host: "127.0.0.1".into(),
            port,
            database: "db".into(),
        }
    }

    #[tokio::test]
    async fn test_bye_on_pooled_connection_reconnects() {
        let address = closing_peer(1).await;
        let backend = RemoteBackend::connect(address, OpenMode::Create, RemoteSettings::default())
            .await
            .unwrap();

        backend.commit().await.unwrap();
        assert_eq!(backend.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_bye_is_a_failure() {
        let address = closing_peer(usize::MAX).await;
        let backend = RemoteBackend::connect(address, OpenMode::Create, RemoteSettings::default())
            .await
            .unwrap();

        let result = backend
            .index(&Document::new("a", serde_json::json!(1)))
            .await;
        assert!(matches!(result, Err(BackendError::Remote(_))));
        // The closed connection is not returned to the pool
        assert_eq!(backend.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_reopen_drops_idle_connections() {
        let (address, _peer) = fake_peer().await;
        let backend = RemoteBackend::connect(address, OpenMode::Create, RemoteSettings::default())
            .await
            .unwrap();
        assert_eq!(backend.idle_connections(), 1);

        backend.reopen().await.unwrap();
        assert_eq!(backend.idle_connections(), 0);
        backend.commit().await.unwrap();
        assert_eq!(backend.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_using_missing_database() {
        let (address, _peer) = fake_peer().await;
        let result = RemoteBackend::connect(address, OpenMode::Open, RemoteSettings::default()).await;
        assert!(matches!(result, Err(ResolutionError::NoSuchDatabase(_))));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let address = RemoteAddress {
            scheme: "lindex".into(),
            host: "127.0.0.1".into(),
            port,
            database: "db".into(),
        };
        let result = RemoteBackend::connect(address, OpenMode::Create, RemoteSettings::default()).await;
        assert!(matches!(
            result,
            Err(ResolutionError::EndpointUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_requests_reuse_pooled_connection() {
        let (address, _peer) = fake_peer().await;
        let backend = RemoteBackend::connect(address, OpenMode::Create, RemoteSettings::default())
            .await
            .unwrap();
        assert_eq!(backend.idle_connections(), 1);

        backend.commit().await.unwrap();
        assert_eq!(backend.count(&Query::new("*")).await.unwrap(), 7);
        assert_eq!(backend.idle_connections(), 1);

        backend.close().await.unwrap();
        assert_eq!(backend.idle_connections(), 0);
        assert_eq!(backend.commit().await, Err(BackendError::Closed));
    }
}
