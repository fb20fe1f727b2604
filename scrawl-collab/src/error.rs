//! Unified error type for the sync engine.
//!
//! Module-local error enums (history, storage, auth, protocol) convert
//! into [`CollabError`] at the boundaries where the server and client
//! assemble replies. The mapping onto wire error codes lives next to the
//! wire types in [`crate::protocol`].

use scrawl_ot::OtError;

use crate::auth::AuthError;
use crate::history::HistoryError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by document actors, the server, and the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// An operation's declared source length does not match the text it
    /// was applied or transformed against.
    LengthMismatch { expected: usize, got: usize },

    /// Catch-up from the requested version is impossible; the history
    /// window has moved past it. Callers fall back to a snapshot resync.
    HistoryTrimmed { requested: u64, oldest: u64 },

    /// A frame or operation failed structural validation.
    InvalidOperationSchema(String),

    /// Divergent edits that automatic reconciliation refuses to merge.
    ConflictUnresolvable,

    /// The backing document store rejected a load or persist.
    StorageUnavailable(String),

    /// Authentication failed or the session is not entitled to the
    /// requested document.
    Unauthorized(String),

    /// The document actor has shut down (eviction race); retry attaches.
    DocumentClosed,

    /// The transport closed underneath an in-flight request.
    ConnectionClosed,

    /// A request did not complete within its deadline.
    Timeout,

    /// Wire-level failure that fits no other category.
    Protocol(String),
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthMismatch { expected, got } => {
                write!(f, "Length mismatch: operation expects {} chars, got {}", expected, got)
            }
            Self::HistoryTrimmed { requested, oldest } => {
                write!(
                    f,
                    "History trimmed: version {} requested but oldest retained entry is {}",
                    requested, oldest
                )
            }
            Self::InvalidOperationSchema(msg) => write!(f, "Invalid operation schema: {}", msg),
            Self::ConflictUnresolvable => write!(f, "Conflicting edits require manual resolution"),
            Self::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Self::DocumentClosed => write!(f, "Document actor closed"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<OtError> for CollabError {
    fn from(err: OtError) -> Self {
        match err {
            OtError::LengthMismatch { expected, got } => Self::LengthMismatch { expected, got },
        }
    }
}

impl From<HistoryError> for CollabError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::Trimmed { requested, oldest } => {
                Self::HistoryTrimmed { requested, oldest }
            }
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<AuthError> for CollabError {
    fn from(err: AuthError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

impl From<ProtocolError> for CollabError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ot_error_conversion() {
        let err: CollabError = OtError::LengthMismatch { expected: 5, got: 3 }.into();
        assert_eq!(err, CollabError::LengthMismatch { expected: 5, got: 3 });
    }

    #[test]
    fn test_history_error_conversion() {
        let err: CollabError = HistoryError::Trimmed { requested: 2, oldest: 9 }.into();
        assert_eq!(err, CollabError::HistoryTrimmed { requested: 2, oldest: 9 });
    }

    #[test]
    fn test_display_messages() {
        let err = CollabError::HistoryTrimmed { requested: 2, oldest: 9 };
        assert!(err.to_string().contains("version 2"));
        assert!(err.to_string().contains("oldest retained entry is 9"));

        let err = CollabError::Unauthorized("Invalid authentication token".to_string());
        assert!(err.to_string().starts_with("Unauthorized"));
    }
}
