//! Document persistence
//!
//! Uses the sled embedded database. Documents are stored as JSON under their
//! id so the inverted index can be rebuilt when a database is reopened.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{BackendError, BackendResult};
use crate::types::Document;

const DOCUMENTS_TREE: &str = "documents";

/// On-disk document store for one database
pub struct DocumentStore {
    db: sled::Db,
    documents: sled::Tree,
}

impl DocumentStore {
    /// Open the store rooted at `path`
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path.join("documents.sled")).map_err(|e| {
            BackendError::Storage(format!("Failed to open document database at {:?}: {}", path, e))
        })?;
        Self::from_db(db)
    }

    /// Open a store that lives only as long as this process
    pub fn temporary() -> BackendResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> BackendResult<Self> {
        let documents = db.open_tree(DOCUMENTS_TREE)?;
        Ok(Self { db, documents })
    }

    /// Store a document, replacing any previous version with the same id
    pub fn put(&self, document: &Document) -> BackendResult<()> {
        let data = serde_json::to_vec(document)?;
        self.documents.insert(document.id.as_bytes(), data)?;
        Ok(())
    }

    /// Delete a document, returning whether it existed
    pub fn remove(&self, id: &str) -> BackendResult<bool> {
        Ok(self.documents.remove(id.as_bytes())?.is_some())
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Load every stored document. Entries that fail to decode are skipped.
    pub fn load_all(&self) -> Vec<Document> {
        let mut loaded = Vec::with_capacity(self.documents.len());
        for entry in self.documents.iter() {
            match entry {
                Ok((key, value)) => match serde_json::from_slice::<Document>(&value) {
                    Ok(doc) => loaded.push(doc),
                    Err(e) => warn!(
                        "Skipping undecodable document {:?}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    ),
                },
                Err(e) => warn!("Failed to read document entry: {}", e),
            }
        }
        debug!("Loaded {} documents from storage", loaded.len());
        loaded
    }

    /// Flush buffered writes to disk
    pub fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
