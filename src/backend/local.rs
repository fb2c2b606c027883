//! Local database adapter
//!
//! Wraps a [`DocumentStore`] and the in-memory [`InvertedIndex`] rebuilt from
//! it. Disk work runs on the blocking pool so the connection tasks are never
//! stalled by sled.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::traits::{BackendKind, StorageBackend};
use super::OpenMode;
use crate::error::{BackendError, BackendResult, ResolutionError};
use crate::index::{document_terms, DocumentStore, InvertedIndex};
use crate::query::Query;
use crate::types::{BackendResults, Document};

struct LocalInner {
    store: DocumentStore,
    index: RwLock<InvertedIndex>,
    /// Serializes writes so the store and the index change together
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LocalInner {
    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }
}

/// Database stored on this server's disk
#[derive(Clone)]
pub struct LocalBackend {
    path: Option<PathBuf>,
    inner: Arc<LocalInner>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend").field("path", &self.path).finish()
    }
}

impl LocalBackend {
    /// Open the database at `path`.
    ///
    /// With [`OpenMode::Open`] a missing directory is `NoSuchDatabase`; with
    /// [`OpenMode::Create`] it is created.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, ResolutionError> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        if !path.is_dir() {
            match mode {
                OpenMode::Open => return Err(ResolutionError::NoSuchDatabase(shown)),
                OpenMode::Create => {
                    std::fs::create_dir_all(path).map_err(|e| {
                        ResolutionError::EndpointUnreachable {
                            endpoint: shown.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    info!("Created database at {}", shown);
                }
            }
        }

        let store = DocumentStore::open(path).map_err(|e| ResolutionError::EndpointUnreachable {
            endpoint: shown.clone(),
            reason: e.to_string(),
        })?;

        let backend = Self::from_store(Some(path.to_path_buf()), store);
        debug!(
            "Opened database at {} ({} documents)",
            shown,
            backend.inner.index.read().len()
        );
        Ok(backend)
    }

    /// Database that lives only in this process
    pub fn in_memory() -> BackendResult<Self> {
        Ok(Self::from_store(None, DocumentStore::temporary()?))
    }

    fn from_store(path: Option<PathBuf>, store: DocumentStore) -> Self {
        let mut index = InvertedIndex::new();
        for document in store.load_all() {
            index.insert(&document);
        }
        Self {
            path,
            inner: Arc::new(LocalInner {
                store,
                index: RwLock::new(index),
                write_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Directory holding the database, if it is on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.inner.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn blocking<T, F>(&self, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalInner) -> BackendResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.ensure_open()?;
            f(&inner)
        })
        .await
        .map_err(|e| BackendError::Storage(format!("storage task failed: {}", e)))?
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn index(&self, document: &Document) -> BackendResult<()> {
        let document = document.clone();
        self.blocking(move |inner| {
            // Terms are generated before anything is persisted
            let terms = document_terms(&document);
            let _guard = inner.write_lock.lock();
            inner.store.put(&document)?;
            inner.index.write().insert_terms(&document, terms);
            Ok(())
        })
        .await
    }

    async fn search(&self, query: &Query) -> BackendResult<BackendResults> {
        let query = query.clone();
        self.blocking(move |inner| {
            let limit = query.limit.unwrap_or(usize::MAX);
            Ok(inner.index.read().search(&query, limit))
        })
        .await
    }

    async fn count(&self, query: &Query) -> BackendResult<u64> {
        let query = query.clone();
        self.blocking(move |inner| Ok(inner.index.read().count(&query)))
            .await
    }

    async fn delete(&self, id: &str) -> BackendResult<bool> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let _guard = inner.write_lock.lock();
            let stored = inner.store.remove(&id)?;
            let indexed = inner.index.write().remove(&id);
            Ok(stored || indexed)
        })
        .await
    }

    async fn commit(&self) -> BackendResult<()> {
        self.blocking(|inner| inner.store.flush()).await
    }

    async fn reopen(&self) -> BackendResult<()> {
        self.blocking(|inner| {
            let _guard = inner.write_lock.lock();
            let mut index = InvertedIndex::new();
            for document in inner.store.load_all() {
                index.insert(&document);
            }
            *inner.index.write() = index;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> BackendResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.store.flush())
            .await
            .map_err(|e| BackendError::Storage(format!("storage task failed: {}", e)))?
    }
}
