//! WebSocket sync client with offline-capable operation queueing.
//!
//! The client keeps three pieces of text state:
//!
//! ```text
//!   base_text   server-confirmed text at server_version
//!   queue       unacknowledged local operations, in order
//!   local_text  base_text with the queue applied; what the user sees
//! ```
//!
//! Local edits apply to `local_text` immediately and join the queue; the
//! head of the queue is submitted to the server one at a time. Remote
//! operations are folded through the queue with `transform`, so the
//! user's pending edits survive concurrent traffic. When the client has
//! been away longer than the server retains history, it falls back to a
//! snapshot and three-way merges: clean divergence replays
//! automatically, overlapping edits surface as
//! [`SyncEvent::ConflictDetected`] for manual resolution.
//!
//! The queue is journaled to disk (when configured) so pending edits and
//! the session identity survive a client restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use scrawl_ot::{conflicts, diff, transform, Operation};

use crate::error::CollabError;
use crate::history::HistoryEntry;
use crate::offline::{JournalState, OfflineQueue, QueueJournal, QueuedOperation};
use crate::presence::{PresenceRoster, PresenceUpdate, RemotePeer};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};

/// Origin id used for the server side of a snapshot three-way merge.
/// Distinct from every session id so insert ties resolve determinately.
const SERVER_DIFF_ORIGIN: Uuid = Uuid::nil();

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A remote operation was merged into the local text. The operation
    /// is already rebased across pending local edits and applies to the
    /// text exactly as the application last saw it.
    RemoteOp {
        operation: Operation,
        version: u64,
        origin_session: Uuid,
    },
    /// A local edit was committed by the server.
    Acked { local_seq: u64, version: u64 },
    /// The local view was replaced wholesale; `content` is the new
    /// local text with any pending edits rebased on top.
    SnapshotApplied { content: String, version: u64 },
    /// A peer joined, left, or moved its cursor.
    RemotePresence {
        session_id: Uuid,
        update: PresenceUpdate,
    },
    /// Local and server edits overlap and cannot merge automatically.
    /// The application must produce a merged text and call
    /// [`SyncClient::resolve_conflict`].
    ConflictDetected {
        base: String,
        local: String,
        server: String,
    },
    /// The server rejected a request.
    ServerError { code: ErrorCode, message: String },
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Token presented in the join handshake.
    pub token: String,
    pub document_id: Uuid,
    /// Resubmit the in-flight operation if no ack arrives in this long.
    pub ack_timeout: Duration,
    /// Offline queue capacity; at the bound new edits compose into the
    /// newest queued entry instead of being rejected.
    pub queue_capacity: usize,
    /// Journal location; `None` disables persistence.
    pub journal_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        token: impl Into<String>,
        document_id: Uuid,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            document_id,
            ack_timeout: Duration::from_secs(3),
            queue_capacity: 1024,
            journal_path: None,
        }
    }
}

/// Snapshot held while the application merges by hand.
struct PendingConflict {
    server_text: String,
    server_version: u64,
}

/// Remote operation buffered while a resync or conflict hold is active.
struct HeldOp {
    operation: Operation,
    version: u64,
    origin: Uuid,
}

/// Outcome of comparing local state against a server snapshot.
enum Reconciliation {
    /// Nothing to merge; adopt the snapshot as-is.
    Adopt,
    /// Local divergence replays cleanly on top of the snapshot.
    Replay {
        local_text: String,
        operation: Operation,
    },
    /// Overlapping edits; manual merge required.
    Conflict,
}

/// Three-way merge of local state against a server snapshot.
///
/// `base_text` is the last text both sides agreed on. The local and
/// server edits are recovered with `diff` and checked for overlapping
/// spans; a clean pair is transformed so the local edit replays on top
/// of the snapshot.
fn reconcile_snapshot(
    base_text: &str,
    local_text: &str,
    snapshot: &str,
    snapshot_version: u64,
    session_id: Uuid,
) -> Result<Reconciliation, scrawl_ot::OtError> {
    if local_text == snapshot || local_text == base_text {
        return Ok(Reconciliation::Adopt);
    }

    let local_edit = diff(base_text, local_text, snapshot_version, session_id);
    let server_edit = diff(base_text, snapshot, snapshot_version, SERVER_DIFF_ORIGIN);
    if conflicts(&local_edit, &server_edit) {
        return Ok(Reconciliation::Conflict);
    }

    let (rebased, _) = transform(&local_edit, &server_edit)?;
    let new_local = rebased.apply(snapshot)?;
    let mut operation = rebased;
    operation.base_version = snapshot_version;
    operation.origin = session_id;
    Ok(Reconciliation::Replay {
        local_text: new_local,
        operation,
    })
}

/// The synchronization state machine. Owned by [`SyncClient`] behind a
/// mutex; the reader task, the resubmit ticker, and the public API all
/// drive it through that lock.
struct ClientCore {
    session_id: Uuid,
    document_id: Uuid,
    base_text: String,
    local_text: String,
    server_version: u64,
    next_seq: u64,
    queue: OfflineQueue,
    journal: Option<QueueJournal>,
    roster: PresenceRoster,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    /// `(local_seq, sent_at)` of the submission awaiting its ack.
    in_flight: Option<(u64, Instant)>,
    /// True between a join or resync request and its snapshot/history
    /// reply; gates the submit pump and holds incoming remote ops.
    awaiting_sync: bool,
    held: Vec<HeldOp>,
    conflict: Option<PendingConflict>,
    /// True once some server state has been adopted; enables resume.
    has_synced: bool,
    /// Reader task for the live connection, aborted on explicit
    /// disconnect so the socket actually closes.
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl ClientCore {
    fn new(config: &ClientConfig, event_tx: mpsc::Sender<SyncEvent>) -> Self {
        let journal = config.journal_path.clone().map(QueueJournal::new);
        let mut session_id = Uuid::new_v4();
        let mut base_text = String::new();
        let mut server_version = 0;
        let mut next_seq = 1;
        let mut has_synced = false;
        let mut queue = OfflineQueue::new(config.queue_capacity);

        if let Some(journal) = &journal {
            match journal.load() {
                Ok(Some(state)) if state.document_id == config.document_id => {
                    log::info!(
                        "Recovered journal: {} pending ops at version {}",
                        state.entries.len(),
                        state.server_version
                    );
                    session_id = state.session_id;
                    base_text = state.base_text;
                    server_version = state.server_version;
                    next_seq = state.next_seq.max(1);
                    has_synced = state.has_synced;
                    for entry in state.entries {
                        if let Err(e) = queue.push(entry) {
                            log::warn!("Recovered journal entry does not chain: {}", e);
                        }
                    }
                }
                Ok(Some(state)) => {
                    log::warn!(
                        "Journal belongs to document {}, starting fresh",
                        state.document_id
                    );
                }
                Ok(None) => {}
                Err(e) => log::warn!("Journal recovery failed: {}", e),
            }
        }

        // Rebuild the visible text by replaying the queue on the base.
        let mut local_text = base_text.clone();
        let mut chain_intact = true;
        for entry in queue.iter() {
            match entry.operation.apply(&local_text) {
                Ok(next) => local_text = next,
                Err(e) => {
                    log::warn!("Journal entries do not chain ({}), dropping them", e);
                    chain_intact = false;
                    break;
                }
            }
        }
        if !chain_intact {
            queue.clear();
            local_text = base_text.clone();
        }

        Self {
            session_id,
            document_id: config.document_id,
            base_text,
            local_text,
            server_version,
            next_seq,
            queue,
            journal,
            roster: PresenceRoster::new(session_id),
            outgoing: None,
            event_tx,
            in_flight: None,
            awaiting_sync: false,
            held: Vec::new(),
            conflict: None,
            has_synced,
            reader_task: None,
        }
    }

    fn is_online(&self) -> bool {
        self.outgoing.is_some()
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn send_frame(&self, message: &ClientMessage) -> Result<(), CollabError> {
        let Some(tx) = &self.outgoing else {
            return Err(CollabError::ConnectionClosed);
        };
        let encoded = message.encode()?;
        tx.send(encoded)
            .await
            .map_err(|_| CollabError::ConnectionClosed)
    }

    fn journal_state(&self) -> JournalState {
        JournalState {
            session_id: self.session_id,
            document_id: self.document_id,
            server_version: self.server_version,
            next_seq: self.next_seq,
            has_synced: self.has_synced,
            base_text: self.base_text.clone(),
            entries: self.queue.iter().cloned().collect(),
        }
    }

    fn sync_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.rewrite(&self.journal_state()) {
                log::warn!("Journal write failed: {}", e);
            }
        }
    }

    /// Submit the queue head unless something blocks it: offline, a
    /// resync in progress, a pending conflict, or an op already in
    /// flight.
    async fn pump(&mut self) {
        if !self.is_online()
            || self.awaiting_sync
            || self.conflict.is_some()
            || self.in_flight.is_some()
        {
            return;
        }
        let Some(head) = self.queue.head() else {
            return;
        };
        let seq = head.local_seq;
        let frame = ClientMessage::Op {
            document_id: self.document_id,
            local_seq: seq,
            operation: head.operation.clone(),
        };
        if self.send_frame(&frame).await.is_ok() {
            self.in_flight = Some((seq, Instant::now()));
        }
    }

    fn insert_op(&self, position: usize, text: &str) -> Result<Operation, CollabError> {
        let total = self.local_text.chars().count();
        if position > total {
            return Err(CollabError::InvalidOperationSchema(format!(
                "insert position {} beyond text length {}",
                position, total
            )));
        }
        let base = self.server_version + self.queue.len() as u64;
        Ok(Operation::new(base, self.session_id)
            .retain(position)
            .insert(text)
            .retain(total - position))
    }

    fn delete_op(&self, position: usize, len: usize) -> Result<Operation, CollabError> {
        let total = self.local_text.chars().count();
        if position + len > total {
            return Err(CollabError::InvalidOperationSchema(format!(
                "delete range {}..{} beyond text length {}",
                position,
                position + len,
                total
            )));
        }
        let base = self.server_version + self.queue.len() as u64;
        Ok(Operation::new(base, self.session_id)
            .retain(position)
            .delete(len)
            .retain(total - position - len))
    }

    /// Apply a local edit and queue it for submission.
    async fn submit_local(&mut self, operation: Operation) -> Result<(), CollabError> {
        if self.conflict.is_some() {
            return Err(CollabError::ConflictUnresolvable);
        }
        if operation.is_identity() {
            return Ok(());
        }
        let applied = operation.apply(&self.local_text)?;
        let seq = self.next_seq;
        self.next_seq += 1;

        let before = self.queue.len();
        self.queue.push(QueuedOperation::new(seq, operation))?;
        self.local_text = applied;

        if let Some(journal) = &self.journal {
            let appended = self.queue.len() > before && journal.path().exists();
            let result = if appended {
                match self.queue.iter().last() {
                    Some(entry) => journal.append(entry),
                    None => Ok(()),
                }
            } else {
                // First write, or the edit composed into the tail.
                journal.rewrite(&self.journal_state())
            };
            if let Err(e) = result {
                log::warn!("Journal write failed: {}", e);
            }
        }

        self.pump().await;
        Ok(())
    }

    async fn handle_ack(&mut self, local_seq: u64, version: u64) -> Result<(), CollabError> {
        if self.in_flight.map(|(seq, _)| seq) == Some(local_seq) {
            self.in_flight = None;
        }

        let acked_len = self
            .queue
            .iter()
            .take_while(|e| e.local_seq <= local_seq)
            .count() as u64;
        if acked_len == 0 {
            // Redundant ack, e.g. a resubmit raced the original commit.
            log::debug!("Ack for seq {} matches nothing queued", local_seq);
            self.pump().await;
            return Ok(());
        }
        if version != self.server_version + acked_len {
            // The ack does not follow our version chain, so frames were
            // lost somewhere. Resync rather than guess.
            log::warn!(
                "Ack at version {} does not follow local version {}; resyncing",
                version,
                self.server_version
            );
            self.request_resync().await;
            return Ok(());
        }

        for entry in self.queue.acknowledge(local_seq) {
            self.base_text = entry.operation.apply(&self.base_text)?;
        }
        self.server_version = version;
        self.sync_journal();
        self.emit(SyncEvent::Acked { local_seq, version }).await;
        self.pump().await;
        Ok(())
    }

    async fn handle_remote_op(
        &mut self,
        operation: Operation,
        version: u64,
        origin: Uuid,
    ) -> Result<(), CollabError> {
        if self.awaiting_sync || self.conflict.is_some() {
            self.held.push(HeldOp {
                operation,
                version,
                origin,
            });
            return Ok(());
        }
        self.integrate_remote(operation, version, origin).await
    }

    /// Fold one committed server operation into local state.
    async fn integrate_remote(
        &mut self,
        operation: Operation,
        version: u64,
        origin: Uuid,
    ) -> Result<(), CollabError> {
        if version <= self.server_version {
            log::debug!(
                "Skipping op at version {} (already at {})",
                version,
                self.server_version
            );
            return Ok(());
        }
        if version != self.server_version + 1 {
            log::warn!(
                "Op at version {} skips ahead of {}; resyncing",
                version,
                self.server_version
            );
            self.request_resync().await;
            return Ok(());
        }

        if origin == self.session_id {
            // Our own commit observed through history replay. It
            // acknowledges the queue head, whose rebased form matches
            // the committed operation.
            if let Some(head_seq) = self.queue.head().map(|e| e.local_seq) {
                for entry in self.queue.acknowledge(head_seq) {
                    self.base_text = entry.operation.apply(&self.base_text)?;
                }
                self.server_version = version;
                if self.in_flight.map(|(seq, _)| seq) == Some(head_seq) {
                    self.in_flight = None;
                }
                self.sync_journal();
                self.emit(SyncEvent::Acked {
                    local_seq: head_seq,
                    version,
                })
                .await;
                return Ok(());
            }
            log::debug!(
                "Own op at version {} with empty queue; folding into base",
                version
            );
        }

        let rebased = self.queue.rebase(&operation)?;
        self.base_text = operation.apply(&self.base_text)?;
        self.local_text = rebased.apply(&self.local_text)?;
        self.server_version = version;
        self.sync_journal();
        self.emit(SyncEvent::RemoteOp {
            operation: rebased,
            version,
            origin_session: origin,
        })
        .await;
        Ok(())
    }

    async fn handle_history(&mut self, entries: Vec<HistoryEntry>) -> Result<(), CollabError> {
        log::info!("Replaying {} missed operations", entries.len());
        self.awaiting_sync = false;
        for entry in entries {
            self.integrate_remote(entry.operation, entry.version, entry.origin)
                .await?;
        }
        self.has_synced = true;
        self.sync_journal();
        self.drain_held().await?;
        self.pump().await;
        Ok(())
    }

    async fn handle_snapshot(&mut self, content: String, version: u64) -> Result<(), CollabError> {
        match reconcile_snapshot(
            &self.base_text,
            &self.local_text,
            &content,
            version,
            self.session_id,
        )? {
            Reconciliation::Adopt => {
                self.base_text = content.clone();
                self.local_text = content.clone();
                self.queue.clear();
                self.server_version = version;
                self.in_flight = None;
                self.awaiting_sync = false;
                self.has_synced = true;
                self.sync_journal();
                self.emit(SyncEvent::SnapshotApplied { content, version })
                    .await;
                self.drain_held().await?;
            }
            Reconciliation::Replay {
                local_text,
                operation,
            } => {
                log::info!(
                    "Replaying local divergence on top of snapshot version {}",
                    version
                );
                let seq = self.next_seq;
                self.next_seq += 1;
                self.base_text = content;
                self.local_text = local_text.clone();
                self.server_version = version;
                self.queue.clear();
                self.queue.push(QueuedOperation::new(seq, operation))?;
                self.in_flight = None;
                self.awaiting_sync = false;
                self.has_synced = true;
                self.sync_journal();
                self.emit(SyncEvent::SnapshotApplied {
                    content: local_text,
                    version,
                })
                .await;
                self.drain_held().await?;
                self.pump().await;
            }
            Reconciliation::Conflict => {
                log::warn!(
                    "Local edits overlap server changes at version {}; manual merge required",
                    version
                );
                self.conflict = Some(PendingConflict {
                    server_text: content.clone(),
                    server_version: version,
                });
                self.awaiting_sync = false;
                self.in_flight = None;
                self.emit(SyncEvent::ConflictDetected {
                    base: self.base_text.clone(),
                    local: self.local_text.clone(),
                    server: content,
                })
                .await;
                // Held ops stay held until the conflict is resolved.
            }
        }
        Ok(())
    }

    async fn resolve_conflict(&mut self, merged: String) -> Result<(), CollabError> {
        let Some(conflict) = self.conflict.take() else {
            return Err(CollabError::Protocol(
                "no conflict awaiting resolution".to_string(),
            ));
        };

        self.base_text = conflict.server_text;
        self.server_version = conflict.server_version;
        self.queue.clear();
        self.in_flight = None;

        let operation = diff(
            &self.base_text,
            &merged,
            self.server_version,
            self.session_id,
        );
        self.local_text = merged;
        if !operation.is_identity() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.queue.push(QueuedOperation::new(seq, operation))?;
        }
        self.has_synced = true;
        self.sync_journal();
        self.drain_held().await?;
        self.pump().await;
        Ok(())
    }

    /// Integrate remote ops buffered during a resync or conflict hold.
    async fn drain_held(&mut self) -> Result<(), CollabError> {
        let held = std::mem::take(&mut self.held);
        for op in held {
            if self.awaiting_sync || self.conflict.is_some() {
                self.held.push(op);
                continue;
            }
            self.integrate_remote(op.operation, op.version, op.origin)
                .await?;
        }
        Ok(())
    }

    async fn handle_presence(&mut self, session_id: Uuid, update: PresenceUpdate) {
        self.roster.handle(session_id, &update);
        self.emit(SyncEvent::RemotePresence { session_id, update })
            .await;
    }

    async fn handle_server_error(&mut self, code: ErrorCode, message: String) {
        if code == ErrorCode::HistoryTrimmed && self.awaiting_sync {
            log::info!("History trimmed past our version; falling back to snapshot");
            if self.send_frame(&ClientMessage::SnapshotRequest).await.is_err() {
                self.awaiting_sync = false;
            }
            return;
        }
        log::warn!("Server error {:?}: {}", code, message);
        self.emit(SyncEvent::ServerError { code, message }).await;
    }

    /// Recover from a version gap by requesting the history we missed.
    /// The server replies with `History` while its window still covers
    /// us, or `Error { HistoryTrimmed }`, which falls back to a
    /// snapshot.
    async fn request_resync(&mut self) {
        self.in_flight = None;
        self.awaiting_sync = true;
        let request = ClientMessage::HistoryRequest {
            since_version: self.server_version,
        };
        if self.send_frame(&request).await.is_err() {
            // Offline; the next connect performs the resync instead.
            self.awaiting_sync = false;
        }
    }

    /// Abandon incremental recovery and resync from a full snapshot.
    /// Used when local state can no longer be trusted; replaying
    /// history onto it would only fail again.
    async fn request_snapshot_resync(&mut self) {
        self.in_flight = None;
        self.awaiting_sync = true;
        if self.send_frame(&ClientMessage::SnapshotRequest).await.is_err() {
            self.awaiting_sync = false;
        }
    }

    /// Resubmit the in-flight operation if its ack is overdue. The head
    /// may have been rebased since the original send; the server treats
    /// the redelivery idempotently by `local_seq`.
    async fn resubmit_if_stalled(&mut self, ack_timeout: Duration) {
        let Some((seq, sent_at)) = self.in_flight else {
            return;
        };
        if sent_at.elapsed() < ack_timeout {
            return;
        }
        let Some(head) = self.queue.head() else {
            self.in_flight = None;
            return;
        };
        if head.local_seq != seq {
            self.in_flight = None;
            self.pump().await;
            return;
        }
        log::warn!("No ack for seq {} after {:?}, resubmitting", seq, ack_timeout);
        let frame = ClientMessage::Op {
            document_id: self.document_id,
            local_seq: seq,
            operation: head.operation.clone(),
        };
        if self.send_frame(&frame).await.is_ok() {
            self.in_flight = Some((seq, Instant::now()));
        }
    }

    fn on_disconnected(&mut self) {
        self.outgoing = None;
        self.in_flight = None;
        self.awaiting_sync = false;
        self.held.clear();
    }
}

/// The sync client.
///
/// Wraps the state machine in a mutex shared with the connection tasks
/// and exposes the editing API the application drives.
pub struct SyncClient {
    config: ClientConfig,
    core: Arc<Mutex<ClientCore>>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a client. If a journal is configured and holds state for
    /// this document, the previous session (identity, synced base and
    /// pending edits) is recovered.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let core = ClientCore::new(&config, event_tx.clone());
        Self {
            config,
            core: Arc::new(Mutex::new(core)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document.
    ///
    /// Spawns the writer, reader and resubmit tasks. A client that has
    /// synced before resumes from its last known version; the server
    /// replies with the missed history or, if that is gone, an error
    /// that triggers the snapshot fallback.
    pub async fn connect(&mut self) -> Result<(), CollabError> {
        {
            let mut core = self.core.lock().await;
            if let Some(old) = core.reader_task.take() {
                old.abort();
            }
            *self.state.write().await = if core.has_synced {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
        }

        match tokio_tungstenite::connect_async(&self.config.server_url).await {
            Ok((ws_stream, _)) => {
                let (mut ws_writer, mut ws_reader) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

                // Writer task: forward outgoing frames to the socket.
                tokio::spawn(async move {
                    while let Some(data) = out_rx.recv().await {
                        if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                });

                {
                    let mut core = self.core.lock().await;
                    core.outgoing = Some(out_tx);
                    core.awaiting_sync = true;
                    core.held.clear();
                    let join = ClientMessage::Join {
                        document_id: core.document_id,
                        session_id: core.session_id,
                        token: self.config.token.clone(),
                        resume_from: core.has_synced.then_some(core.server_version),
                    };
                    core.send_frame(&join).await?;
                }

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(SyncEvent::Connected).await;

                // Reader task: decode and dispatch server frames.
                let core = self.core.clone();
                let state = self.state.clone();
                let event_tx = self.event_tx.clone();
                let reader = tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(Message::Binary(data)) => {
                                let bytes: Vec<u8> = data.into();
                                match ServerMessage::decode(&bytes) {
                                    Ok(server_msg) => {
                                        if let Err(e) = dispatch(&core, server_msg).await {
                                            log::error!(
                                                "Failed to integrate server message: {}",
                                                e
                                            );
                                            core.lock().await.request_snapshot_resync().await;
                                        }
                                    }
                                    Err(e) => log::warn!("Undecodable server frame: {}", e),
                                }
                            }
                            Ok(Message::Close(_)) | Err(_) => break,
                            _ => {}
                        }
                    }

                    core.lock().await.on_disconnected();
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(SyncEvent::Disconnected).await;
                });
                self.core.lock().await.reader_task = Some(reader);

                // Resubmit ticker: nudges the in-flight op when its ack
                // is overdue. Exits once the connection is gone.
                let core = self.core.clone();
                let ack_timeout = self.config.ack_timeout;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(ack_timeout / 2);
                    loop {
                        ticker.tick().await;
                        let mut core = core.lock().await;
                        let gone = core
                            .outgoing
                            .as_ref()
                            .map(|tx| tx.is_closed())
                            .unwrap_or(true);
                        if gone {
                            break;
                        }
                        core.resubmit_if_stalled(ack_timeout).await;
                    }
                });

                Ok(())
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {}", self.config.server_url, e);
                *self.state.write().await = ConnectionState::Disconnected;
                Err(CollabError::ConnectionClosed)
            }
        }
    }

    /// Close the connection. Pending edits stay queued (and journaled)
    /// for the next connect.
    pub async fn disconnect(&self) {
        let (was_online, reader) = {
            let mut core = self.core.lock().await;
            let was_online = core.outgoing.is_some();
            core.on_disconnected();
            (was_online, core.reader_task.take())
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        if was_online {
            let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        }
    }

    /// Insert `text` at `position` (char index) in the local text.
    pub async fn insert(&self, position: usize, text: &str) -> Result<(), CollabError> {
        let mut core = self.core.lock().await;
        let operation = core.insert_op(position, text)?;
        core.submit_local(operation).await
    }

    /// Delete `len` chars starting at `position` from the local text.
    pub async fn delete(&self, position: usize, len: usize) -> Result<(), CollabError> {
        let mut core = self.core.lock().await;
        let operation = core.delete_op(position, len)?;
        core.submit_local(operation).await
    }

    /// Submit a pre-built operation against the current local text. The
    /// base version and origin are overwritten to fit the queue chain.
    pub async fn submit_operation(&self, mut operation: Operation) -> Result<(), CollabError> {
        let mut core = self.core.lock().await;
        operation.base_version = core.server_version + core.queue.len() as u64;
        operation.origin = core.session_id;
        core.submit_local(operation).await
    }

    /// Report the local caret. Throttled; silently dropped when offline.
    pub async fn send_cursor(
        &self,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> Result<(), CollabError> {
        let mut core = self.core.lock().await;
        if !core.is_online() {
            return Ok(());
        }
        let Some(update) = core.roster.update_local_cursor(position, selection) else {
            return Ok(());
        };
        core.send_frame(&ClientMessage::Presence(update)).await
    }

    /// Send an application-level ping.
    pub async fn send_ping(&self) -> Result<(), CollabError> {
        let core = self.core.lock().await;
        if !core.is_online() {
            return Ok(());
        }
        core.send_frame(&ClientMessage::Ping).await
    }

    /// Resolve a pending conflict with the application's merged text.
    /// The merged text becomes the local text; its difference from the
    /// server snapshot is queued for submission.
    pub async fn resolve_conflict(&self, merged: impl Into<String>) -> Result<(), CollabError> {
        self.core.lock().await.resolve_conflict(merged.into()).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn document_id(&self) -> Uuid {
        self.config.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub async fn session_id(&self) -> Uuid {
        self.core.lock().await.session_id
    }

    /// The text as the user should see it: server state plus pending
    /// local edits.
    pub async fn local_text(&self) -> String {
        self.core.lock().await.local_text.clone()
    }

    /// Version of the last server state integrated.
    pub async fn server_version(&self) -> u64 {
        self.core.lock().await.server_version
    }

    /// Number of local edits not yet acknowledged.
    pub async fn pending_ops(&self) -> usize {
        self.core.lock().await.queue.len()
    }

    pub async fn has_pending_conflict(&self) -> bool {
        self.core.lock().await.conflict.is_some()
    }

    /// Remote peers currently known to the presence roster.
    pub async fn peers(&self) -> Vec<RemotePeer> {
        self.core
            .lock()
            .await
            .roster
            .peers()
            .values()
            .cloned()
            .collect()
    }
}

async fn dispatch(
    core: &Arc<Mutex<ClientCore>>,
    message: ServerMessage,
) -> Result<(), CollabError> {
    match message {
        ServerMessage::Ack { local_seq, version } => {
            core.lock().await.handle_ack(local_seq, version).await
        }
        ServerMessage::Op {
            operation,
            version,
            origin_session,
        } => {
            core.lock()
                .await
                .handle_remote_op(operation, version, origin_session)
                .await
        }
        ServerMessage::Snapshot(payload) => {
            let content = payload.content()?;
            core.lock()
                .await
                .handle_snapshot(content, payload.version)
                .await
        }
        ServerMessage::History { entries } => core.lock().await.handle_history(entries).await,
        ServerMessage::Presence { session_id, update } => {
            core.lock().await.handle_presence(session_id, update).await;
            Ok(())
        }
        ServerMessage::Error { code, message } => {
            core.lock().await.handle_server_error(code, message).await;
            Ok(())
        }
        ServerMessage::Pong => Ok(()),
    }
}
