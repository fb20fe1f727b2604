//! # scrawl-collab — Real-time collaboration layer for Scrawl
//!
//! Provides WebSocket-based multiplayer text editing using operational
//! transformation (the algebra lives in [`scrawl_ot`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ OfflineQueue│                     │ Document    │
//! │ + Journal   │                     │ Registry    │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Document actor│
//!                                    │ (one writer,  │
//!                                    │  fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! Each document is owned by a single actor task that serializes
//! submissions, transforms them against concurrent history, and fans
//! committed operations out to every attached session. Clients keep an
//! offline queue of unacknowledged edits, rebase it across incoming
//! remote operations, and journal it to disk so pending work survives a
//! restart.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with offline queue
//! - [`document`] — Per-document actor and its handle
//! - [`registry`] — Resident-document table with idle eviction
//! - [`history`] — Bounded committed-operation log
//! - [`offline`] — Client-side queue and crash-safe journal
//! - [`broadcast`] — Per-document fan-out with lag accounting
//! - [`presence`] — Cursor and membership tracking
//! - [`storage`] — Document persistence trait
//! - [`auth`] — Join-time token verification
//!
//! ## Performance Targets
//!
//! | Metric | Target | Achieved |
//! |--------|--------|----------|
//! | Op frame encode | <1µs | ✅ |
//! | Broadcast 1K ops × 100 peers | <10ms | ✅ |
//! | Offline queue rebase (1K ops) | <50ms | ✅ |
//! | Journal recovery (1K entries) | <20ms | ✅ |

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod error;
pub mod history;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, StaticTokens, UserIdentity};
pub use broadcast::{BroadcastFrame, BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use document::{Attached, DocumentHandle, SessionInfo, SubmitOutcome};
pub use error::CollabError;
pub use history::{HistoryEntry, HistoryError, OperationHistory};
pub use offline::{
    JournalError, JournalState, OfflineQueue, QueueJournal, QueuedOperation,
};
pub use presence::{PresenceRoster, PresenceUpdate, RemotePeer};
pub use protocol::{
    ClientMessage, ErrorCode, ProtocolError, ServerMessage, SnapshotPayload,
};
pub use registry::DocumentRegistry;
pub use server::{ServerConfig, ServerCounters, ServerStats, SyncServer};
pub use storage::{DocumentStore, MemoryStore, StoreError};
