//! Per-document single-writer actor.
//!
//! Every resident document is owned by exactly one tokio task. All
//! mutation flows through its command channel, so operations are applied
//! strictly one at a time and version numbers form a gapless sequence.
//! Connections never share document state; they hold a cloneable
//! [`DocumentHandle`] and await replies over oneshot channels.
//!
//! ```text
//!  connection tasks                 document actor
//!  ───────────────                  ──────────────
//!  handle.submit() ──┐
//!  handle.attach() ──┼── mpsc ───►  transform → apply → history
//!  handle.history() ─┘                    │
//!        ▲                                ▼
//!        └── oneshot reply        broadcast committed frame
//! ```
//!
//! The actor also owns the document lifecycle: it persists dirty state on
//! a flush interval and when the last session detaches, and it shuts
//! itself down after the idle grace period, notifying the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use scrawl_ot::{transform, Operation};

use crate::auth::UserIdentity;
use crate::broadcast::{BroadcastFrame, BroadcastGroup};
use crate::error::CollabError;
use crate::history::{HistoryEntry, OperationHistory};
use crate::presence::PresenceUpdate;
use crate::protocol::ServerMessage;
use crate::server::{ServerConfig, ServerCounters};
use crate::storage::DocumentStore;

/// Identity a connection presents when attaching to a document.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user: UserIdentity,
}

/// Successful attach: the document state to seed the client with, plus
/// the frame stream every committed operation and presence update rides.
#[derive(Debug)]
pub struct Attached {
    pub content: String,
    pub version: u64,
    /// Online sessions other than the new one, for roster seeding.
    pub peers: Vec<(Uuid, UserIdentity)>,
    pub frames: broadcast::Receiver<BroadcastFrame>,
}

/// Result of a submit command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Committed at `version`. The ack reaches the origin through its
    /// broadcast receiver, ordered after every earlier commit.
    Committed { version: u64 },
    /// Redelivery of an already-committed submission; the caller acks
    /// immediately with the cached version.
    Duplicate { local_seq: u64, version: u64 },
}

pub(crate) enum DocCommand {
    Attach {
        session: SessionInfo,
        reply: oneshot::Sender<Result<Attached, CollabError>>,
    },
    Detach {
        session_id: Uuid,
    },
    Submit {
        session_id: Uuid,
        local_seq: u64,
        operation: Operation,
        reply: oneshot::Sender<Result<SubmitOutcome, CollabError>>,
    },
    History {
        since_version: u64,
        reply: oneshot::Sender<Result<Vec<HistoryEntry>, CollabError>>,
    },
    Snapshot {
        reply: oneshot::Sender<(String, u64)>,
    },
    Presence {
        session_id: Uuid,
        update: PresenceUpdate,
    },
}

/// Cloneable handle to a document actor.
#[derive(Clone, Debug)]
pub struct DocumentHandle {
    tx: mpsc::Sender<DocCommand>,
}

impl DocumentHandle {
    pub async fn attach(&self, session: SessionInfo) -> Result<Attached, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DocCommand::Attach { session, reply })
            .await
            .map_err(|_| CollabError::DocumentClosed)?;
        rx.await.map_err(|_| CollabError::DocumentClosed)?
    }

    pub async fn detach(&self, session_id: Uuid) {
        let _ = self.tx.send(DocCommand::Detach { session_id }).await;
    }

    pub async fn submit(
        &self,
        session_id: Uuid,
        local_seq: u64,
        operation: Operation,
    ) -> Result<SubmitOutcome, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DocCommand::Submit {
                session_id,
                local_seq,
                operation,
                reply,
            })
            .await
            .map_err(|_| CollabError::DocumentClosed)?;
        rx.await.map_err(|_| CollabError::DocumentClosed)?
    }

    pub async fn history(&self, since_version: u64) -> Result<Vec<HistoryEntry>, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DocCommand::History {
                since_version,
                reply,
            })
            .await
            .map_err(|_| CollabError::DocumentClosed)?;
        rx.await.map_err(|_| CollabError::DocumentClosed)?
    }

    pub async fn snapshot(&self) -> Result<(String, u64), CollabError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DocCommand::Snapshot { reply })
            .await
            .map_err(|_| CollabError::DocumentClosed)?;
        rx.await.map_err(|_| CollabError::DocumentClosed)
    }

    pub async fn presence(&self, session_id: Uuid, update: PresenceUpdate) {
        let _ = self
            .tx
            .send(DocCommand::Presence { session_id, update })
            .await;
    }

    /// True once the actor has shut down (evicted or dropped).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct SessionState {
    user: UserIdentity,
    online: bool,
    /// Last acknowledged `(local_seq, version)`, kept across reconnects
    /// within the document's residency so redelivered submissions are
    /// acked without reapplying.
    last_ack: Option<(u64, u64)>,
}

/// Spawn the actor task for one document and return its handle.
pub(crate) fn spawn(
    document_id: Uuid,
    content: String,
    version: u64,
    store: Arc<dyn DocumentStore>,
    config: ServerConfig,
    counters: Arc<ServerCounters>,
    evicted_tx: mpsc::UnboundedSender<Uuid>,
) -> DocumentHandle {
    let (tx, cmd_rx) = mpsc::channel(64);
    let history = OperationHistory::new(config.history_retention, version);
    let group = BroadcastGroup::new(config.broadcast_capacity);
    let eviction_grace = config.eviction_grace;

    let actor = DocumentActor {
        document_id,
        content,
        version,
        history,
        sessions: HashMap::new(),
        group,
        store,
        config,
        counters,
        cmd_rx,
        evicted_tx,
        dirty: false,
        // Armed at birth: a document nobody attaches to still gets evicted.
        idle_deadline: Some(Instant::now() + eviction_grace),
    };
    tokio::spawn(actor.run());

    DocumentHandle { tx }
}

struct DocumentActor {
    document_id: Uuid,
    content: String,
    version: u64,
    history: OperationHistory,
    sessions: HashMap<Uuid, SessionState>,
    group: BroadcastGroup,
    store: Arc<dyn DocumentStore>,
    config: ServerConfig,
    counters: Arc<ServerCounters>,
    cmd_rx: mpsc::Receiver<DocCommand>,
    evicted_tx: mpsc::UnboundedSender<Uuid>,
    dirty: bool,
    idle_deadline: Option<Instant>,
}

impl DocumentActor {
    async fn run(mut self) {
        log::info!(
            "Document {} resident at version {}",
            self.document_id,
            self.version
        );
        let mut flush = tokio::time::interval(self.config.persist_interval);

        loop {
            let evict_at = self
                .idle_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Registry dropped every handle; shut down.
                    None => break,
                },

                _ = flush.tick() => {
                    if self.dirty {
                        self.persist().await;
                    }
                }

                _ = tokio::time::sleep_until(evict_at), if self.idle_deadline.is_some() => {
                    log::info!("Evicting idle document {}", self.document_id);
                    break;
                }
            }
        }

        if self.dirty {
            self.persist().await;
        }
        self.counters.documents_evicted.fetch_add(1, Ordering::Relaxed);
        let _ = self.evicted_tx.send(self.document_id);
    }

    async fn handle_command(&mut self, cmd: DocCommand) {
        match cmd {
            DocCommand::Attach { session, reply } => {
                let result = self.handle_attach(session);
                let _ = reply.send(result);
            }
            DocCommand::Detach { session_id } => self.handle_detach(session_id).await,
            DocCommand::Submit {
                session_id,
                local_seq,
                operation,
                reply,
            } => {
                let result = self.handle_submit(session_id, local_seq, operation);
                let _ = reply.send(result);
            }
            DocCommand::History {
                since_version,
                reply,
            } => {
                let result = self
                    .history
                    .since(since_version)
                    .map_err(CollabError::from);
                if result.is_ok() {
                    self.counters.history_served.fetch_add(1, Ordering::Relaxed);
                }
                let _ = reply.send(result);
            }
            DocCommand::Snapshot { reply } => {
                self.counters
                    .snapshots_served
                    .fetch_add(1, Ordering::Relaxed);
                let _ = reply.send((self.content.clone(), self.version));
            }
            DocCommand::Presence { session_id, update } => {
                self.relay_presence(session_id, &update);
            }
        }
    }

    fn handle_attach(&mut self, session: SessionInfo) -> Result<Attached, CollabError> {
        let online = self.online_session_count();
        let rejoining = self
            .sessions
            .get(&session.session_id)
            .map(|s| s.online)
            .unwrap_or(false);
        if !rejoining && online >= self.config.max_sessions_per_document {
            return Err(CollabError::Protocol("session limit reached".to_string()));
        }

        let peers: Vec<(Uuid, UserIdentity)> = self
            .sessions
            .iter()
            .filter(|(id, s)| s.online && **id != session.session_id)
            .map(|(id, s)| (*id, s.user.clone()))
            .collect();

        let entry = self
            .sessions
            .entry(session.session_id)
            .or_insert_with(|| SessionState {
                user: session.user.clone(),
                online: false,
                last_ack: None,
            });
        entry.online = true;
        entry.user = session.user.clone();
        self.idle_deadline = None;

        // Announce before subscribing so the new receiver does not see
        // its own join.
        self.relay_presence(
            session.session_id,
            &PresenceUpdate::Join {
                user: session.user,
            },
        );
        let frames = self.group.subscribe();

        log::info!(
            "Session {} attached to document {} at version {}",
            session.session_id,
            self.document_id,
            self.version
        );

        Ok(Attached {
            content: self.content.clone(),
            version: self.version,
            peers,
            frames,
        })
    }

    async fn handle_detach(&mut self, session_id: Uuid) {
        match self.sessions.get_mut(&session_id) {
            Some(state) if state.online => state.online = false,
            _ => return,
        }
        self.relay_presence(session_id, &PresenceUpdate::Leave);
        log::info!(
            "Session {} detached from document {}",
            session_id,
            self.document_id
        );

        if self.online_session_count() == 0 {
            if self.dirty {
                self.persist().await;
            }
            self.idle_deadline = Some(Instant::now() + self.config.eviction_grace);
            log::debug!("Document {} idle, eviction armed", self.document_id);
        }
    }

    fn handle_submit(
        &mut self,
        session_id: Uuid,
        local_seq: u64,
        operation: Operation,
    ) -> Result<SubmitOutcome, CollabError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| CollabError::Unauthorized("session not attached".to_string()))?;

        // Redelivery of an already-committed submission (ack lost or
        // timed out on the client): replay the cached ack, apply nothing.
        if let Some((acked_seq, acked_version)) = session.last_ack {
            if local_seq <= acked_seq {
                self.counters
                    .duplicate_submissions
                    .fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Duplicate submission seq {} from session {} (acked at v{})",
                    local_seq,
                    session_id,
                    acked_version
                );
                return Ok(SubmitOutcome::Duplicate {
                    local_seq,
                    version: acked_version,
                });
            }
        }

        if operation.origin != session_id {
            return Err(CollabError::InvalidOperationSchema(format!(
                "operation origin {} does not match session {}",
                operation.origin, session_id
            )));
        }

        let mut operation = operation.optimize();

        if operation.base_version > self.version {
            // A base this document has never reached; the client must resync.
            return Err(CollabError::HistoryTrimmed {
                requested: operation.base_version,
                oldest: self.history.oldest_version().unwrap_or(self.version),
            });
        }

        // Rebase across everything committed since the client's base.
        if operation.base_version < self.version {
            let missed = self.history.since(operation.base_version)?;
            for entry in &missed {
                let (rebased, _) = transform(&operation, &entry.operation)?;
                operation = rebased;
                self.counters.ops_transformed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.content = operation.apply(&self.content)?;
        self.version += 1;
        self.dirty = true;
        self.counters.ops_applied.fetch_add(1, Ordering::Relaxed);

        self.history.append(HistoryEntry {
            version: self.version,
            operation: operation.clone(),
            origin: session_id,
        });

        if let Some(state) = self.sessions.get_mut(&session_id) {
            state.last_ack = Some((local_seq, self.version));
        }

        // Fan out the committed form. The origin's connection converts
        // its own frame into the ack, everyone else forwards the op.
        let msg = ServerMessage::Op {
            operation,
            version: self.version,
            origin_session: session_id,
        };
        match msg.encode() {
            Ok(bytes) => {
                self.group.publish(BroadcastFrame::committed_op(
                    session_id,
                    local_seq,
                    self.version,
                    Arc::new(bytes),
                ));
            }
            Err(e) => log::error!(
                "Failed to encode op frame for document {}: {}",
                self.document_id,
                e
            ),
        }

        Ok(SubmitOutcome::Committed {
            version: self.version,
        })
    }

    fn relay_presence(&mut self, session_id: Uuid, update: &PresenceUpdate) {
        let msg = ServerMessage::Presence {
            session_id,
            update: update.clone(),
        };
        match msg.encode() {
            Ok(bytes) => {
                self.group
                    .publish(BroadcastFrame::relay(session_id, Arc::new(bytes)));
            }
            Err(e) => log::error!("Failed to encode presence frame: {}", e),
        }
    }

    async fn persist(&mut self) {
        match self
            .store
            .persist(self.document_id, &self.content, self.version)
            .await
        {
            Ok(()) => {
                self.dirty = false;
                log::debug!(
                    "Persisted document {} at version {}",
                    self.document_id,
                    self.version
                );
            }
            Err(e) => {
                // Stay dirty; the next flush retries.
                log::error!("Persist failed for document {}: {}", self.document_id, e);
            }
        }
    }

    fn online_session_count(&self) -> usize {
        self.sessions.values().filter(|s| s.online).count()
    }
}
