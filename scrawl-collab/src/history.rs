//! Bounded per-document operation history.
//!
//! Every committed operation is appended here in version order. The buffer
//! keeps the most recent `capacity` entries; older entries are discarded as
//! new ones arrive. Catch-up requests for a version that has already been
//! trimmed fail with [`HistoryError::Trimmed`], which callers turn into a
//! full-snapshot resync.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scrawl_ot::Operation;

/// A committed operation together with the version it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Document version after applying `operation`.
    pub version: u64,
    /// The operation as committed, fully transformed against its predecessors.
    pub operation: Operation,
    /// Session that submitted the operation.
    pub origin: Uuid,
}

/// History access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The requested range starts before the oldest retained entry.
    Trimmed { requested: u64, oldest: u64 },
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trimmed { requested, oldest } => write!(
                f,
                "History trimmed: version {} requested but oldest retained entry is {}",
                requested, oldest
            ),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Ring buffer of the most recent committed operations.
#[derive(Debug)]
pub struct OperationHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    /// Version of the newest committed operation, or the version the
    /// document was loaded at when no entries have been appended yet.
    head: u64,
}

impl OperationHistory {
    /// Create a history window starting at `base_version` (the version the
    /// document held when it was loaded).
    pub fn new(capacity: usize, base_version: u64) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            head: base_version,
        }
    }

    /// Append a committed entry, evicting the oldest if the buffer is full.
    pub fn append(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.head = entry.version;
        self.entries.push_back(entry);
    }

    /// Entries with version strictly greater than `version`, oldest first.
    ///
    /// Returns an empty vector when `version` is already the head. Fails
    /// with [`HistoryError::Trimmed`] when the gap between `version` and the
    /// oldest retained entry cannot be bridged.
    pub fn since(&self, version: u64) -> Result<Vec<HistoryEntry>, HistoryError> {
        if version >= self.head {
            if version == self.head {
                return Ok(Vec::new());
            }
            return Err(self.trimmed(version));
        }
        match self.entries.front() {
            Some(front) if front.version <= version + 1 => Ok(self
                .entries
                .iter()
                .filter(|e| e.version > version)
                .cloned()
                .collect()),
            _ => Err(self.trimmed(version)),
        }
    }

    fn trimmed(&self, requested: u64) -> HistoryError {
        HistoryError::Trimmed {
            requested,
            oldest: self.oldest_version().unwrap_or(self.head),
        }
    }

    /// Version of the newest entry, or the load version when empty.
    pub fn head_version(&self) -> u64 {
        self.head
    }

    /// Version of the oldest retained entry, if any.
    pub fn oldest_version(&self) -> Option<u64> {
        self.entries.front().map(|e| e.version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
