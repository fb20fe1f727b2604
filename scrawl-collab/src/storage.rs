//! Document persistence behind a pluggable async trait.
//!
//! The engine treats storage as a collaborator: document actors load
//! state through [`DocumentStore`] when a document becomes resident and
//! persist through it on the periodic flush, on eviction, and when the
//! last session detaches. A failed persist never takes the document
//! down; the actor stays dirty and retries on the next flush.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and
//! the demo server. Production deployments implement the trait over
//! their own database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The backing store is unreachable or rejected the request.
    Unavailable(String),
    /// Stored bytes exist but cannot be interpreted.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            Self::Corrupt(e) => write!(f, "Stored document corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable source of document text and version.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document's text and version. `Ok(None)` means the
    /// document has never been persisted; callers start it empty at
    /// version 0.
    async fn load(&self, document_id: Uuid) -> Result<Option<(String, u64)>, StoreError>;

    /// Write a document's current text and version.
    async fn persist(&self, document_id: Uuid, content: &str, version: u64)
        -> Result<(), StoreError>;
}

/// In-memory store for tests and the demo server.
///
/// `set_unavailable(true)` makes every call fail, which is how tests
/// exercise the degraded-storage paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, (String, u64)>>,
    unavailable: AtomicBool,
    persist_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of successful persists since creation.
    pub fn persist_count(&self) -> u64 {
        self.persist_count.load(Ordering::Relaxed)
    }

    /// Seed a document directly, bypassing the trait.
    pub async fn seed(&self, document_id: Uuid, content: impl Into<String>, version: u64) {
        self.documents
            .write()
            .await
            .insert(document_id, (content.into(), version));
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, document_id: Uuid) -> Result<Option<(String, u64)>, StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(self.documents.read().await.get(&document_id).cloned())
    }

    async fn persist(
        &self,
        document_id: Uuid,
        content: &str,
        version: u64,
    ) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        self.documents
            .write()
            .await
            .insert(document_id, (content.to_string(), version));
        self.persist_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_document() {
        let store = MemoryStore::new();
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        store.persist(id, "hello", 3).await.unwrap();

        let (content, version) = store.load(id).await.unwrap().unwrap();
        assert_eq!(content, "hello");
        assert_eq!(version, 3);
        assert_eq!(store.persist_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_overwrites() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        store.persist(id, "v1", 1).await.unwrap();
        store.persist(id, "v2", 2).await.unwrap();

        let (content, version) = store.load(id).await.unwrap().unwrap();
        assert_eq!(content, "v2");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.persist(id, "kept", 1).await.unwrap();

        store.set_unavailable(true);
        assert!(store.load(id).await.is_err());
        assert!(store.persist(id, "lost", 2).await.is_err());

        // Recovery restores the previously persisted state.
        store.set_unavailable(false);
        let (content, version) = store.load(id).await.unwrap().unwrap();
        assert_eq!(content, "kept");
        assert_eq!(version, 1);
    }
}
