//! Storage backends
//!
//! Every endpoint is served by one [`Backend`]: a database on this server's
//! disk or a database hosted by a peer server. Both implement
//! [`StorageBackend`], which is all the orchestration layer sees.

mod factory;
mod local;
mod remote;
mod traits;

pub use factory::*;
pub use local::*;
pub use remote::*;
pub use traits::*;

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::query::Query;
use crate::types::{BackendResults, Document};

/// Whether a missing database may be created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `CREATE`: create the database if needed
    Create,
    /// `USING`: the database must already exist
    Open,
}

/// Backend selected when an endpoint is resolved
#[derive(Debug)]
pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Backend {
    fn inner(&self) -> &dyn StorageBackend {
        match self {
            Self::Local(local) => local,
            Self::Remote(remote) => remote,
        }
    }
}

#[async_trait]
impl StorageBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    async fn index(&self, document: &Document) -> BackendResult<()> {
        self.inner().index(document).await
    }

    async fn search(&self, query: &Query) -> BackendResult<BackendResults> {
        self.inner().search(query).await
    }

    async fn count(&self, query: &Query) -> BackendResult<u64> {
        self.inner().count(query).await
    }

    async fn delete(&self, id: &str) -> BackendResult<bool> {
        self.inner().delete(id).await
    }

    async fn commit(&self) -> BackendResult<()> {
        self.inner().commit().await
    }

    async fn reopen(&self) -> BackendResult<()> {
        self.inner().reopen().await
    }

    async fn close(&self) -> BackendResult<()> {
        self.inner().close().await
    }
}
