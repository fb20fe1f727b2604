//! WebSocket server for real-time collaborative editing.
//!
//! Accepts connections, authenticates them, and bridges each one to the
//! single-writer actor of the document it joins:
//!
//! ```text
//!   clients ──ws──► connection task ──► DocumentRegistry ──► DocumentActor
//!                        │                                        │
//!                        ◄────────── broadcast frames ◄───────────┘
//! ```
//!
//! Every connection serves exactly one document. The first frame must be
//! a `Join`; until it arrives nothing else is accepted. After a
//! successful join the task pumps two streams concurrently: client
//! frames going up to the actor, and committed frames coming back down.
//! A connection's own committed frame is delivered to it as an `Ack`
//! rather than an echo of the operation, so acknowledgements are always
//! ordered behind every operation committed before them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::broadcast::BroadcastFrame;
use crate::document::{DocumentHandle, SessionInfo, SubmitOutcome};
use crate::error::CollabError;
use crate::presence::PresenceUpdate;
use crate::protocol::{ClientMessage, ServerMessage, SnapshotPayload};
use crate::registry::DocumentRegistry;
use crate::storage::DocumentStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_addr: String,
    /// Committed operations retained per document, bounding how far
    /// behind a submission or catch-up request may be.
    pub history_retention: usize,
    /// Capacity of each document's broadcast channel. Connections that
    /// fall further behind than this lose frames and must resync.
    pub broadcast_capacity: usize,
    /// Maximum simultaneously online sessions per document.
    pub max_sessions_per_document: usize,
    /// How long a document stays resident after its last session
    /// detaches before it is persisted and evicted.
    pub eviction_grace: Duration,
    /// Interval between background persists of dirty documents.
    pub persist_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            history_retention: 512,
            broadcast_capacity: 256,
            max_sessions_per_document: 100,
            eviction_grace: Duration::from_secs(300),
            persist_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Configuration with aggressive timings for tests: an ephemeral
    /// loopback port, a short eviction grace, and a fast flush interval.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            eviction_grace: Duration::from_millis(100),
            persist_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

/// Monotonic event counters shared across connection tasks and actors.
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub ops_applied: AtomicU64,
    pub ops_transformed: AtomicU64,
    pub duplicate_submissions: AtomicU64,
    pub snapshots_served: AtomicU64,
    pub history_served: AtomicU64,
    pub documents_loaded: AtomicU64,
    pub documents_evicted: AtomicU64,
}

impl ServerCounters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            ops_transformed: self.ops_transformed.load(Ordering::Relaxed),
            duplicate_submissions: self.duplicate_submissions.load(Ordering::Relaxed),
            snapshots_served: self.snapshots_served.load(Ordering::Relaxed),
            history_served: self.history_served.load(Ordering::Relaxed),
            documents_loaded: self.documents_loaded.load(Ordering::Relaxed),
            documents_evicted: self.documents_evicted.load(Ordering::Relaxed),
            resident_documents: 0,
        }
    }
}

/// Point-in-time view of the counters plus registry occupancy.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub ops_applied: u64,
    pub ops_transformed: u64,
    pub duplicate_submissions: u64,
    pub snapshots_served: u64,
    pub history_served: u64,
    pub documents_loaded: u64,
    pub documents_evicted: u64,
    pub resident_documents: usize,
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    auth: Arc<dyn Authenticator>,
    counters: Arc<ServerCounters>,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

impl SyncServer {
    /// Create a server over the given store and authenticator.
    ///
    /// Must be called from within a tokio runtime; the registry spawns
    /// its reaper task immediately.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let counters = Arc::new(ServerCounters::default());
        let registry = Arc::new(DocumentRegistry::new(
            store,
            config.clone(),
            counters.clone(),
        ));
        Self {
            config,
            registry,
            auth,
            counters,
        }
    }

    /// Address the server will bind to.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Current statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.counters.snapshot();
        stats.resident_documents = self.registry.resident_count().await;
        stats
    }

    /// Run the accept loop. Never returns under normal operation.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("TCP connection from {}", addr);

            let registry = self.registry.clone();
            let auth = self.auth.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, auth, counters.clone()).await
                {
                    log::error!("Connection error from {}: {}", addr, e);
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle a single WebSocket connection for its whole lifetime.
    async fn handle_connection(
        stream: TcpStream,
        addr: std::net::SocketAddr,
        registry: Arc<DocumentRegistry>,
        auth: Arc<dyn Authenticator>,
        counters: Arc<ServerCounters>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {}", addr);

        // Populated by the Join frame.
        let mut session_id: Option<Uuid> = None;
        let mut joined_document: Option<Uuid> = None;
        let mut handle: Option<DocumentHandle> = None;
        let mut frames_rx: Option<broadcast::Receiver<BroadcastFrame>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            counters.messages_received.fetch_add(1, Ordering::Relaxed);
                            counters
                                .bytes_received
                                .fetch_add(bytes.len() as u64, Ordering::Relaxed);

                            let client_msg = match ClientMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    // Framing is broken; nothing after this
                                    // frame can be trusted.
                                    log::warn!("Undecodable frame from {}: {}", addr, e);
                                    let err = CollabError::Protocol(e.to_string());
                                    send_message(&mut ws_sender, &ServerMessage::error(&err))
                                        .await?;
                                    break;
                                }
                            };

                            match client_msg {
                                ClientMessage::Join {
                                    document_id,
                                    session_id: sid,
                                    token,
                                    resume_from,
                                } => {
                                    if handle.is_some() {
                                        log::warn!("Repeated join from {}, ignoring", addr);
                                        continue;
                                    }

                                    let user = match auth.authenticate(&token).await {
                                        Ok(user) => user,
                                        Err(e) => {
                                            log::warn!("Rejected join from {}: {}", addr, e);
                                            let err = CollabError::from(e);
                                            send_message(
                                                &mut ws_sender,
                                                &ServerMessage::error(&err),
                                            )
                                            .await?;
                                            break;
                                        }
                                    };
                                    log::info!(
                                        "Session {} ({}) joining document {}",
                                        sid,
                                        user.name,
                                        document_id
                                    );

                                    let session = SessionInfo {
                                        session_id: sid,
                                        user,
                                    };
                                    let attached =
                                        match registry.attach(document_id, session).await {
                                            Ok((doc, attached)) => {
                                                handle = Some(doc);
                                                attached
                                            }
                                            Err(e) => {
                                                log::warn!(
                                                    "Attach to {} failed for {}: {}",
                                                    document_id,
                                                    addr,
                                                    e
                                                );
                                                send_message(
                                                    &mut ws_sender,
                                                    &ServerMessage::error(&e),
                                                )
                                                .await?;
                                                break;
                                            }
                                        };
                                    session_id = Some(sid);
                                    joined_document = Some(document_id);

                                    // Roster first so the client knows peer
                                    // names before any cursor arrives.
                                    for (peer_session, peer_user) in &attached.peers {
                                        let roster = ServerMessage::Presence {
                                            session_id: *peer_session,
                                            update: PresenceUpdate::Join {
                                                user: peer_user.clone(),
                                            },
                                        };
                                        send_message(&mut ws_sender, &roster).await?;
                                    }

                                    match resume_from {
                                        None => {
                                            let payload = SnapshotPayload::new(
                                                &attached.content,
                                                attached.version,
                                            );
                                            counters
                                                .snapshots_served
                                                .fetch_add(1, Ordering::Relaxed);
                                            send_message(
                                                &mut ws_sender,
                                                &ServerMessage::Snapshot(payload),
                                            )
                                            .await?;
                                        }
                                        Some(since) => {
                                            // The client claims state at
                                            // `since`; replay what it missed
                                            // or tell it to resync.
                                            let doc = handle
                                                .as_ref()
                                                .ok_or(CollabError::DocumentClosed)?;
                                            match doc.history(since).await {
                                                Ok(entries) => {
                                                    send_message(
                                                        &mut ws_sender,
                                                        &ServerMessage::History { entries },
                                                    )
                                                    .await?;
                                                }
                                                Err(e) => {
                                                    send_message(
                                                        &mut ws_sender,
                                                        &ServerMessage::error(&e),
                                                    )
                                                    .await?;
                                                    if !matches!(
                                                        e,
                                                        CollabError::HistoryTrimmed { .. }
                                                    ) {
                                                        break;
                                                    }
                                                }
                                            }
                                        }
                                    }

                                    frames_rx = Some(attached.frames);
                                }
                                ClientMessage::Op {
                                    document_id,
                                    local_seq,
                                    operation,
                                } => {
                                    let (Some(sid), Some(doc)) = (session_id, handle.as_ref())
                                    else {
                                        log::warn!("Operation before join from {}", addr);
                                        let err = CollabError::Unauthorized(
                                            "join required".to_string(),
                                        );
                                        send_message(&mut ws_sender, &ServerMessage::error(&err))
                                            .await?;
                                        break;
                                    };
                                    if Some(document_id) != joined_document {
                                        let err = CollabError::InvalidOperationSchema(
                                            "operation addressed to a different document"
                                                .to_string(),
                                        );
                                        send_message(&mut ws_sender, &ServerMessage::error(&err))
                                            .await?;
                                        continue;
                                    }

                                    match doc.submit(sid, local_seq, operation).await {
                                        Ok(SubmitOutcome::Committed { .. }) => {
                                            // The ack rides the frame stream,
                                            // ordered behind every earlier
                                            // commit.
                                        }
                                        Ok(SubmitOutcome::Duplicate { local_seq, version }) => {
                                            send_message(
                                                &mut ws_sender,
                                                &ServerMessage::Ack { local_seq, version },
                                            )
                                            .await?;
                                        }
                                        Err(CollabError::DocumentClosed) => {
                                            send_message(
                                                &mut ws_sender,
                                                &ServerMessage::error(
                                                    &CollabError::DocumentClosed,
                                                ),
                                            )
                                            .await?;
                                            break;
                                        }
                                        Err(e) => {
                                            log::warn!(
                                                "Rejected op seq {} from session {}: {}",
                                                local_seq,
                                                sid,
                                                e
                                            );
                                            send_message(
                                                &mut ws_sender,
                                                &ServerMessage::error(&e),
                                            )
                                            .await?;
                                        }
                                    }
                                }
                                ClientMessage::HistoryRequest { since_version } => {
                                    if let Some(doc) = handle.as_ref() {
                                        let reply = match doc.history(since_version).await {
                                            Ok(entries) => ServerMessage::History { entries },
                                            Err(e) => ServerMessage::error(&e),
                                        };
                                        send_message(&mut ws_sender, &reply).await?;
                                    }
                                }
                                ClientMessage::SnapshotRequest => {
                                    if let Some(doc) = handle.as_ref() {
                                        match doc.snapshot().await {
                                            Ok((content, version)) => {
                                                let payload =
                                                    SnapshotPayload::new(&content, version);
                                                send_message(
                                                    &mut ws_sender,
                                                    &ServerMessage::Snapshot(payload),
                                                )
                                                .await?;
                                            }
                                            Err(e) => {
                                                send_message(
                                                    &mut ws_sender,
                                                    &ServerMessage::error(&e),
                                                )
                                                .await?;
                                            }
                                        }
                                    }
                                }
                                ClientMessage::Presence(update) => {
                                    if let (Some(sid), Some(doc)) = (session_id, handle.as_ref())
                                    {
                                        doc.presence(sid, update).await;
                                    }
                                }
                                ClientMessage::Ping => {
                                    send_message(&mut ws_sender, &ServerMessage::Pong).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed by {}", addr);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }

                frame = async {
                    if let Some(ref mut rx) = frames_rx {
                        rx.recv().await
                    } else {
                        std::future::pending().await
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if Some(frame.origin) == session_id {
                                // Own commit: deliver the ack instead of
                                // echoing the operation back.
                                if let Some((local_seq, version)) = frame.ack {
                                    send_message(
                                        &mut ws_sender,
                                        &ServerMessage::Ack { local_seq, version },
                                    )
                                    .await?;
                                }
                            } else {
                                ws_sender
                                    .send(Message::Binary(frame.bytes.to_vec().into()))
                                    .await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!(
                                "Connection {} lagged behind by {} frames",
                                addr,
                                n
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            log::info!("Document stream closed for {}", addr);
                            break;
                        }
                    }
                }
            }
        }

        // Cleanup: tell the actor this session went offline.
        if let (Some(sid), Some(doc)) = (session_id, handle.as_ref()) {
            doc.detach(sid).await;
        }
        log::info!("Connection from {} finished", addr);
        Ok(())
    }
}

async fn send_message(
    sink: &mut WsSink,
    message: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let encoded = message.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use crate::storage::MemoryStore;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.history_retention, 512);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_sessions_per_document, 100);
        assert_eq!(config.eviction_grace, Duration::from_secs(300));
        assert_eq!(config.persist_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_testing_config_shortens_lifecycle_timers() {
        let config = ServerConfig::for_testing();
        assert_eq!(config.eviction_grace, Duration::from_millis(100));
        assert_eq!(config.persist_interval, Duration::from_millis(100));
        assert_eq!(config.history_retention, 512);
    }

    #[tokio::test]
    async fn test_server_creation_and_initial_stats() {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(StaticTokens::new().with_token("secret", "Alice"));
        let server = SyncServer::new(ServerConfig::for_testing(), store, auth);

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.ops_applied, 0);
        assert_eq!(stats.resident_documents, 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_counter_updates() {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(StaticTokens::new().with_token("secret", "Alice"));
        let server = SyncServer::new(ServerConfig::for_testing(), store, auth);

        server.counters.ops_applied.fetch_add(3, Ordering::Relaxed);
        server
            .counters
            .messages_received
            .fetch_add(7, Ordering::Relaxed);

        let stats = server.stats().await;
        assert_eq!(stats.ops_applied, 3);
        assert_eq!(stats.messages_received, 7);
    }
}
