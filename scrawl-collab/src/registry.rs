//! Registry of resident document actors.
//!
//! Maps document ids to live [`DocumentHandle`]s. A document becomes
//! resident on first attach (loaded from the store) and leaves residency
//! when its actor evicts itself; a reaper task drops the dead map entry
//! when the actor's eviction notice arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::document::{self, Attached, DocumentHandle, SessionInfo};
use crate::error::CollabError;
use crate::server::{ServerConfig, ServerCounters};
use crate::storage::DocumentStore;

pub struct DocumentRegistry {
    documents: Arc<RwLock<HashMap<Uuid, DocumentHandle>>>,
    store: Arc<dyn DocumentStore>,
    config: ServerConfig,
    counters: Arc<ServerCounters>,
    evicted_tx: mpsc::UnboundedSender<Uuid>,
}

impl DocumentRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: ServerConfig,
        counters: Arc<ServerCounters>,
    ) -> Self {
        let documents: Arc<RwLock<HashMap<Uuid, DocumentHandle>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (evicted_tx, mut evicted_rx) = mpsc::unbounded_channel();

        // Reaper: drop map entries for actors that evicted themselves.
        let reaper_docs = documents.clone();
        tokio::spawn(async move {
            while let Some(document_id) = evicted_rx.recv().await {
                let mut docs = reaper_docs.write().await;
                // Only remove if the entry still points at the closed
                // actor; a fresh one may have been spawned meanwhile.
                let closed = docs
                    .get(&document_id)
                    .map(|h| h.is_closed())
                    .unwrap_or(false);
                if closed {
                    docs.remove(&document_id);
                    log::debug!("Registry dropped evicted document {}", document_id);
                }
            }
        });

        Self {
            documents,
            store,
            config,
            counters,
            evicted_tx,
        }
    }

    /// Attach a session, loading the document into residency if needed.
    ///
    /// An eviction can race the attach: the handle found in the map may
    /// belong to an actor that already shut down. One retry after
    /// dropping the dead entry suffices, because a freshly spawned actor
    /// starts with a full grace period.
    pub async fn attach(
        &self,
        document_id: Uuid,
        session: SessionInfo,
    ) -> Result<(DocumentHandle, Attached), CollabError> {
        for _ in 0..2 {
            let handle = self.get_or_load(document_id).await?;
            match handle.attach(session.clone()).await {
                Ok(attached) => return Ok((handle, attached)),
                Err(CollabError::DocumentClosed) => {
                    self.drop_if_closed(document_id).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CollabError::DocumentClosed)
    }

    async fn get_or_load(&self, document_id: Uuid) -> Result<DocumentHandle, CollabError> {
        // Fast path: read lock.
        {
            let docs = self.documents.read().await;
            if let Some(handle) = docs.get(&document_id) {
                if !handle.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        // Load outside the lock; a slow store must not block the map.
        let loaded = self.store.load(document_id).await?;

        let mut docs = self.documents.write().await;
        // Double-check after acquiring the write lock.
        if let Some(handle) = docs.get(&document_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let (content, version) = loaded.unwrap_or_default();
        log::info!("Loading document {} at version {}", document_id, version);
        let handle = document::spawn(
            document_id,
            content,
            version,
            self.store.clone(),
            self.config.clone(),
            self.counters.clone(),
            self.evicted_tx.clone(),
        );
        docs.insert(document_id, handle.clone());
        self.counters.documents_loaded.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    async fn drop_if_closed(&self, document_id: Uuid) {
        let mut docs = self.documents.write().await;
        let closed = docs
            .get(&document_id)
            .map(|h| h.is_closed())
            .unwrap_or(false);
        if closed {
            docs.remove(&document_id);
        }
    }

    /// Number of documents currently resident.
    pub async fn resident_count(&self) -> usize {
        self.documents
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .count()
    }

    /// Ids of the currently resident documents.
    pub async fn resident_documents(&self) -> Vec<Uuid> {
        self.documents
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserIdentity;
    use crate::storage::MemoryStore;
    use scrawl_ot::Operation;
    use tokio::time::Duration;

    fn session() -> SessionInfo {
        SessionInfo {
            session_id: Uuid::new_v4(),
            user: UserIdentity::new("tester"),
        }
    }

    fn registry(store: Arc<MemoryStore>) -> DocumentRegistry {
        DocumentRegistry::new(
            store,
            ServerConfig::for_testing(),
            Arc::new(ServerCounters::default()),
        )
    }

    #[tokio::test]
    async fn test_attach_creates_fresh_document() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let (_handle, attached) = registry.attach(Uuid::new_v4(), session()).await.unwrap();

        assert_eq!(attached.content, "");
        assert_eq!(attached.version, 0);
        assert_eq!(registry.resident_count().await, 1);
    }

    #[tokio::test]
    async fn test_attach_loads_persisted_document() {
        let store = Arc::new(MemoryStore::new());
        let document_id = Uuid::new_v4();
        store.seed(document_id, "stored text", 9).await;

        let registry = registry(store);
        let (_handle, attached) = registry.attach(document_id, session()).await.unwrap();

        assert_eq!(attached.content, "stored text");
        assert_eq!(attached.version, 9);
    }

    #[tokio::test]
    async fn test_sessions_share_one_actor() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let document_id = Uuid::new_v4();

        let s1 = session();
        let (h1, _) = registry.attach(document_id, s1.clone()).await.unwrap();
        let op = Operation::new(0, s1.session_id).insert("shared");
        h1.submit(s1.session_id, 1, op).await.unwrap();

        let (h2, attached) = registry.attach(document_id, session()).await.unwrap();
        assert_eq!(attached.content, "shared");
        assert_eq!(attached.version, 1);

        let (content, _) = h2.snapshot().await.unwrap();
        assert_eq!(content, "shared");
        assert_eq!(registry.resident_count().await, 1);
    }

    #[tokio::test]
    async fn test_load_failure_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let document_id = Uuid::new_v4();

        store.set_unavailable(true);
        let err = registry.attach(document_id, session()).await.unwrap_err();
        assert!(matches!(err, CollabError::StorageUnavailable(_)));
        assert_eq!(registry.resident_count().await, 0);

        store.set_unavailable(false);
        assert!(registry.attach(document_id, session()).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_then_reattach_reloads() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let document_id = Uuid::new_v4();

        let s = session();
        let (handle, _) = registry.attach(document_id, s.clone()).await.unwrap();
        let op = Operation::new(0, s.session_id).insert("kept");
        handle.submit(s.session_id, 1, op).await.unwrap();
        handle.detach(s.session_id).await;

        // for_testing grace is 100ms; wait out eviction plus the reaper.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.resident_count().await, 0);

        let (_handle, attached) = registry.attach(document_id, session()).await.unwrap();
        assert_eq!(attached.content, "kept");
        assert_eq!(attached.version, 1);
    }

    #[tokio::test]
    async fn test_distinct_documents_isolated() {
        let registry = registry(Arc::new(MemoryStore::new()));

        let s1 = session();
        let (h1, _) = registry.attach(Uuid::new_v4(), s1.clone()).await.unwrap();
        h1.submit(s1.session_id, 1, Operation::new(0, s1.session_id).insert("one"))
            .await
            .unwrap();

        let (_h2, attached) = registry.attach(Uuid::new_v4(), session()).await.unwrap();
        assert_eq!(attached.content, "");
        assert_eq!(registry.resident_count().await, 2);
    }
}
