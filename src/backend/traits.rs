//! Storage backend capability

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::query::Query;
use crate::types::{BackendResults, Document};

/// Kind of storage behind an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations every endpoint supports, whether it is a local database or a
/// peer server.
///
/// Implementations must be safe to share between sessions. Writes to one
/// backend are serialized by the implementation.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Add or replace a document
    async fn index(&self, document: &Document) -> BackendResult<()>;

    /// Evaluate a query. `query.limit` is the number of hits wanted, counted
    /// from the first match; `query.offset` is always zero here.
    async fn search(&self, query: &Query) -> BackendResult<BackendResults>;

    /// Number of documents matching a query
    async fn count(&self, query: &Query) -> BackendResult<u64>;

    /// Delete a document by id, returning whether it existed
    async fn delete(&self, id: &str) -> BackendResult<bool>;

    /// Make previous writes durable
    async fn commit(&self) -> BackendResult<()>;

    /// Pick up the latest committed state. Backends that always serve it
    /// need not override this.
    async fn reopen(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Release resources. Further calls fail with `BackendError::Closed`.
    async fn close(&self) -> BackendResult<()>;
}
