//! Fan-out broadcast to the sessions of one document.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! session gets an independent receiver that buffers up to `capacity`
//! frames; a session that falls further behind starts losing frames and
//! must resync through history or a snapshot.
//!
//! Frames carry the originating session and optional ack metadata
//! alongside the pre-encoded bytes, so receivers decide what to forward
//! without decoding: non-originators forward the bytes, the originator
//! turns a committed-op frame into its ack. Delivering the ack through
//! the same ordered stream as the op frames is what keeps every session
//! observing commits in commit order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A pre-encoded server frame fanned out to every session receiver.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    /// Session the frame originated from. Receivers belonging to this
    /// session do not forward the bytes.
    pub origin: Uuid,
    /// For committed-op frames: the `(local_seq, version)` the origin's
    /// connection should ack instead of echoing the op back.
    pub ack: Option<(u64, u64)>,
    /// Encoded `ServerMessage`, shared across all receivers.
    pub bytes: Arc<Vec<u8>>,
}

impl BroadcastFrame {
    /// Frame relayed verbatim to everyone except the origin (presence,
    /// server-synthesized notifications).
    pub fn relay(origin: Uuid, bytes: Arc<Vec<u8>>) -> Self {
        Self {
            origin,
            ack: None,
            bytes,
        }
    }

    /// Frame for a committed operation: forwarded to other sessions,
    /// acked to the origin.
    pub fn committed_op(origin: Uuid, local_seq: u64, version: u64, bytes: Arc<Vec<u8>>) -> Self {
        Self {
            origin,
            ack: Some((local_seq, version)),
            bytes,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_receivers: usize,
}

/// Broadcast channel shared by all sessions of one document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<BroadcastFrame>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe a new session receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastFrame> {
        self.sender.subscribe()
    }

    /// Publish a frame to all subscribed receivers.
    ///
    /// Lock-free: tokio broadcast send plus an atomic stats bump.
    /// Returns the number of receivers the frame reached.
    pub fn publish(&self, frame: BroadcastFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}
