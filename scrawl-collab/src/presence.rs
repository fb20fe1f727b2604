//! Presence protocol for real-time cursor and selection awareness.
//!
//! Multiplayer "who's editing where" — caret positions, selections, and
//! user profiles. Presence is soft state: the server relays updates to
//! every other session in the document without validating or storing them,
//! and the roster on each client reconstructs the picture.
//!
//! ## Architecture
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! PresenceRoster::update_local_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! PresenceUpdate::Cursor { … }
//!       │
//!       ▼   (WebSocket relay, no server state)
//! Remote PresenceRoster
//!       │
//!       ▼
//! RemotePeer caret shown in editor margin
//! ```
//!
//! Cursor positions are char offsets into the document. They are NOT
//! transformed against concurrent operations; a stale caret is corrected
//! by the next update, which arrives within tens of milliseconds while
//! the peer is active.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::auth::UserIdentity;

/// Presence update types relayed between sessions.
///
/// Carried inline in protocol frames; the sending session is identified
/// by the frame envelope, not repeated here. Cursor updates are
/// rate-limited to 30fps (33ms) to reduce bandwidth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceUpdate {
    /// Session joined the document. The server synthesizes this from the
    /// verified identity when a session attaches.
    Join { user: UserIdentity },

    /// Session left the document (clean detach or connection drop).
    Leave,

    /// Caret position update (high frequency, rate-limited to 30fps).
    Cursor {
        /// Caret position as a char offset.
        position: usize,
        /// Active selection as a half-open char range, if any.
        selection: Option<(usize, usize)>,
        /// Monotonic per-sender timestamp for stale-update rejection.
        timestamp: u64,
    },
}

/// A remote session's presence state tracked locally.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    /// Verified identity, from the server-synthesized Join.
    pub user: UserIdentity,
    /// Caret position as a char offset, once a cursor update has arrived.
    pub position: Option<usize>,
    /// Active selection range.
    pub selection: Option<(usize, usize)>,
    /// Last network timestamp (monotonic, from sender).
    last_timestamp: u64,
    /// Last time we received any update from this peer.
    last_update: Instant,
}

impl RemotePeer {
    fn new(user: UserIdentity) -> Self {
        Self {
            user,
            position: None,
            selection: None,
            last_timestamp: 0,
            last_update: Instant::now(),
        }
    }

    /// Apply a cursor update, rejecting stale timestamps.
    fn update_cursor(&mut self, position: usize, selection: Option<(usize, usize)>, timestamp: u64) {
        if timestamp < self.last_timestamp {
            return;
        }
        self.position = Some(position);
        self.selection = selection;
        self.last_timestamp = timestamp;
        self.last_update = Instant::now();
    }

    /// Check if this peer has been silent for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }

    /// Time since the last update from this peer.
    pub fn time_since_update(&self) -> Duration {
        self.last_update.elapsed()
    }
}

/// Tracks presence for all remote sessions in one document.
///
/// The local session sends cursor updates through
/// [`update_local_cursor`](Self::update_local_cursor); incoming updates
/// from the relay feed [`handle`](Self::handle).
pub struct PresenceRoster {
    /// Our own session, whose relayed messages are ignored.
    local_session: Uuid,
    /// Remote peer states, indexed by session id.
    peers: HashMap<Uuid, RemotePeer>,
    /// Rate limiter: last time we emitted a cursor update.
    last_cursor_sent: Instant,
    /// Minimum interval between cursor updates (33ms = 30fps).
    cursor_interval: Duration,
    /// Monotonic timestamp counter for outgoing updates.
    timestamp_counter: u64,
    /// Silence threshold after which peers are swept as disconnected.
    idle_timeout: Duration,
}

impl PresenceRoster {
    pub fn new(local_session: Uuid) -> Self {
        Self {
            local_session,
            peers: HashMap::new(),
            // Allow an immediate first cursor update.
            last_cursor_sent: Instant::now() - Duration::from_secs(1),
            cursor_interval: Duration::from_millis(33),
            timestamp_counter: 0,
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Create with a custom rate-limit interval (for testing).
    pub fn with_interval(local_session: Uuid, interval: Duration) -> Self {
        let mut roster = Self::new(local_session);
        roster.cursor_interval = interval;
        roster
    }

    /// Handle a relayed update from `session_id`.
    pub fn handle(&mut self, session_id: Uuid, update: &PresenceUpdate) {
        if session_id == self.local_session {
            return;
        }

        match update {
            PresenceUpdate::Join { user } => {
                self.peers.insert(session_id, RemotePeer::new(user.clone()));
            }

            PresenceUpdate::Leave => {
                self.peers.remove(&session_id);
            }

            PresenceUpdate::Cursor { position, selection, timestamp } => {
                match self.peers.get_mut(&session_id) {
                    Some(peer) => peer.update_cursor(*position, *selection, *timestamp),
                    // Cursor from a peer whose Join we missed (they attached
                    // before we connected): create a placeholder entry.
                    None => {
                        let user = UserIdentity {
                            user_id: session_id,
                            name: format!("Peer-{}", &session_id.to_string()[..8]),
                        };
                        let mut peer = RemotePeer::new(user);
                        peer.update_cursor(*position, *selection, *timestamp);
                        self.peers.insert(session_id, peer);
                    }
                }
            }
        }
    }

    /// Record a local caret move and return the update to send, if the
    /// rate limiter allows one. Returns `None` when throttled.
    pub fn update_local_cursor(
        &mut self,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> Option<PresenceUpdate> {
        if self.last_cursor_sent.elapsed() < self.cursor_interval {
            return None;
        }

        self.timestamp_counter += 1;
        self.last_cursor_sent = Instant::now();

        Some(PresenceUpdate::Cursor {
            position,
            selection,
            timestamp: self.timestamp_counter,
        })
    }

    /// Build a cursor update bypassing the rate limiter.
    pub fn force_cursor_update(
        &mut self,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> PresenceUpdate {
        self.timestamp_counter += 1;
        self.last_cursor_sent = Instant::now();

        PresenceUpdate::Cursor {
            position,
            selection,
            timestamp: self.timestamp_counter,
        }
    }

    /// Remove peers that have been silent longer than the idle timeout.
    /// Returns the swept session ids.
    pub fn sweep_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }

        stale
    }

    pub fn peer(&self, session_id: &Uuid) -> Option<&RemotePeer> {
        self.peers.get(session_id)
    }

    pub fn peers(&self) -> &HashMap<Uuid, RemotePeer> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_session(&self) -> Uuid {
        self.local_session
    }
}
