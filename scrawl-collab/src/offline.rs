//! Client-side offline queue and crash-safe journal.
//!
//! Local edits that the server has not acknowledged yet live in an
//! [`OfflineQueue`] in submission order. While the client is offline the
//! queue absorbs every edit; on reconnect the entries are rebased across
//! whatever the server committed meanwhile and resubmitted one at a
//! time.
//!
//! The queue is mirrored to disk through a [`QueueJournal`] so pending
//! edits survive a client restart:
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                queue.journal                   │
//! │                                                │
//! │  [len│State record]  ← synced base + metadata  │
//! │  [len│Op record]     ← one per queued edit     │
//! │  [len│Op record]                               │
//! │  ...                                           │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Every record carries an FNV-folded checksum. State changes that touch
//! the synced base (acks, integrated remote operations, snapshot resync)
//! rewrite the whole file through a temporary-file rename; fresh local
//! edits are appended. Recovery verifies record by record and stops at
//! the first torn or corrupt record, so a crash mid-append costs at most
//! the record being written.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scrawl_ot::{compose, transform, Operation, OtError};

/// A local edit awaiting server acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Client-local sequence number, monotonic per session.
    pub local_seq: u64,
    pub operation: Operation,
    /// Milliseconds since the epoch when the edit was queued.
    pub queued_at: u64,
}

impl QueuedOperation {
    pub fn new(local_seq: u64, operation: Operation) -> Self {
        Self {
            local_seq,
            operation,
            queued_at: epoch_millis(),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Bounded FIFO of unacknowledged local operations.
///
/// The entries form a chain: the first applies to the synced base text,
/// each later one to the text its predecessor produced. Applying all of
/// them to the base yields the text the user currently sees.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueuedOperation>,
    capacity: usize,
}

impl OfflineQueue {
    /// Create a queue holding at most `capacity` entries. A minimum of
    /// two is enforced so the in-flight head is never composed into.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    /// Queue a local edit. Editing never stalls on a full queue: at
    /// capacity the entry is composed into the newest queued edit
    /// instead, which keeps the chain intact. The head is never the
    /// compose target because it may already be in flight.
    pub fn push(&mut self, entry: QueuedOperation) -> Result<(), OtError> {
        if self.entries.len() < self.capacity {
            self.entries.push_back(entry);
            return Ok(());
        }
        // capacity >= 2, so the tail is not the head here.
        if let Some(tail) = self.entries.back_mut() {
            let combined = compose(&tail.operation, &entry.operation)?;
            tail.operation = combined;
            tail.local_seq = entry.local_seq;
        }
        Ok(())
    }

    /// Remove every entry acknowledged through `local_seq`, returning
    /// them oldest first so the caller can fold them into its synced
    /// base.
    pub fn acknowledge(&mut self, local_seq: u64) -> Vec<QueuedOperation> {
        let mut popped = Vec::new();
        while self
            .entries
            .front()
            .is_some_and(|e| e.local_seq <= local_seq)
        {
            if let Some(entry) = self.entries.pop_front() {
                popped.push(entry);
            }
        }
        popped
    }

    /// The oldest unacknowledged entry, if any.
    pub fn head(&self) -> Option<&QueuedOperation> {
        self.entries.front()
    }

    /// Rebase the whole queue across a committed remote operation.
    ///
    /// Every queued entry is rewritten to apply after `remote`, and the
    /// returned operation is `remote` rewritten to apply after the
    /// queue, ready to run against the text the user sees.
    pub fn rebase(&mut self, remote: &Operation) -> Result<Operation, OtError> {
        let mut incoming = remote.clone();
        for entry in self.entries.iter_mut() {
            let (local, next) = transform(&entry.operation, &incoming)?;
            entry.operation = local;
            incoming = next;
        }
        Ok(incoming)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.entries.iter()
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

/// Journal record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
enum RecordType {
    /// Synced base text plus session metadata.
    State = 1,
    /// One queued operation.
    Operation = 2,
}

/// A single framed journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    /// `0` for the state record, the entry's `local_seq` for operation
    /// records; recovery sorts by this.
    sequence: u64,
    record_type: RecordType,
    payload: Vec<u8>,
    checksum: u32,
}

impl JournalRecord {
    fn new(sequence: u64, record_type: RecordType, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, record_type, &payload);
        Self {
            sequence,
            record_type,
            payload,
            checksum,
        }
    }

    fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.record_type, &self.payload)
    }

    /// XOR-fold all fields through the FNV constants.
    fn compute_checksum(sequence: u64, record_type: RecordType, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        hash ^= sequence as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        hash ^= (sequence >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= record_type as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

/// State-record body. The base text rides LZ4-compressed because it is
/// the one unbounded field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRecord {
    session_id: Uuid,
    document_id: Uuid,
    server_version: u64,
    next_seq: u64,
    has_synced: bool,
    base_text_lz4: Vec<u8>,
}

/// Everything the journal can reconstruct after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalState {
    pub session_id: Uuid,
    pub document_id: Uuid,
    /// Version of `base_text` on the server.
    pub server_version: u64,
    /// Next local sequence number to allocate.
    pub next_seq: u64,
    /// Whether `base_text` was ever confirmed by the server. A journal
    /// written before the first sync recovers as offline-only state.
    pub has_synced: bool,
    /// Last server-synced text; queue entries chain on top of it.
    pub base_text: String,
    /// Pending entries, sorted by `local_seq`.
    pub entries: Vec<QueuedOperation>,
}

/// Journal errors. Corruption is not one of them: a corrupt journal
/// recovers as `Ok(None)` or a shortened entry list, never an error.
#[derive(Debug)]
pub enum JournalError {
    Io(std::io::Error),
    Serialization(String),
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::Io(e) => write!(f, "journal I/O error: {e}"),
            JournalError::Serialization(e) => write!(f, "journal serialization error: {e}"),
        }
    }
}

impl std::error::Error for JournalError {}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Io(e)
    }
}

/// On-disk mirror of an [`OfflineQueue`] and its synced base.
pub struct QueueJournal {
    path: PathBuf,
}

impl QueueJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Rewrite the journal to match `state` exactly.
    ///
    /// Goes through a temporary file and rename, so a crash mid-rewrite
    /// leaves the previous journal intact.
    pub fn rewrite(&self, state: &JournalState) -> Result<(), JournalError> {
        let mut buf = Vec::new();

        let state_record = StateRecord {
            session_id: state.session_id,
            document_id: state.document_id,
            server_version: state.server_version,
            next_seq: state.next_seq,
            has_synced: state.has_synced,
            base_text_lz4: lz4_flex::compress_prepend_size(state.base_text.as_bytes()),
        };
        let payload = encode(&state_record)?;
        push_frame(&mut buf, &JournalRecord::new(0, RecordType::State, payload))?;

        for entry in &state.entries {
            let payload = encode(entry)?;
            push_frame(
                &mut buf,
                &JournalRecord::new(entry.local_seq, RecordType::Operation, payload),
            )?;
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Append one freshly queued entry.
    ///
    /// Append is the hot path while offline, so it skips the fsync; a
    /// torn tail record is dropped by the next recovery.
    pub fn append(&self, entry: &QueuedOperation) -> Result<(), JournalError> {
        let mut buf = Vec::new();
        let payload = encode(entry)?;
        push_frame(
            &mut buf,
            &JournalRecord::new(entry.local_seq, RecordType::Operation, payload),
        )?;

        let mut file = fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&buf)?;
        Ok(())
    }

    /// Recover the journal, if a valid one exists.
    ///
    /// A missing file or an unreadable state record yields `Ok(None)`.
    /// Reading stops at the first torn or corrupt operation record;
    /// everything before it is kept, sorted by `local_seq`.
    pub fn load(&self) -> Result<Option<JournalState>, JournalError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut rest = bytes.as_slice();
        loop {
            if rest.len() < 4 {
                break;
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&rest[..4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            if rest.len() < 4 + len {
                log::warn!("Journal {} has a torn tail record, dropping it", self.path.display());
                break;
            }
            let record: JournalRecord = match decode(&rest[4..4 + len]) {
                Ok(record) => record,
                Err(_) => {
                    log::warn!(
                        "Journal {} has a corrupt record, dropping the tail",
                        self.path.display()
                    );
                    break;
                }
            };
            if !record.verify() {
                log::warn!(
                    "Journal {} checksum mismatch at record seq {}, dropping the tail",
                    self.path.display(),
                    record.sequence
                );
                break;
            }
            records.push(record);
            rest = &rest[4 + len..];
        }

        let mut records = records.into_iter();
        let state = match records.next() {
            Some(record) if record.record_type == RecordType::State => {
                match decode_state(&record.payload) {
                    Some(state) => state,
                    None => {
                        log::warn!(
                            "Journal {} state record is corrupt, starting fresh",
                            self.path.display()
                        );
                        return Ok(None);
                    }
                }
            }
            _ => {
                log::warn!(
                    "Journal {} does not start with a state record, starting fresh",
                    self.path.display()
                );
                return Ok(None);
            }
        };

        let mut entries = Vec::new();
        for record in records {
            if record.record_type != RecordType::Operation {
                continue;
            }
            match decode::<QueuedOperation>(&record.payload) {
                Ok(entry) => entries.push(entry),
                Err(_) => {
                    log::warn!(
                        "Journal {} has an undecodable operation record, dropping the tail",
                        self.path.display()
                    );
                    break;
                }
            }
        }
        entries.sort_by_key(|e| e.local_seq);

        let highest = entries.iter().map(|e| e.local_seq + 1).max().unwrap_or(0);
        let (session_id, document_id, server_version, next_seq, has_synced, base_text) = state;
        Ok(Some(JournalState {
            session_id,
            document_id,
            server_version,
            next_seq: next_seq.max(highest),
            has_synced,
            base_text,
            entries,
        }))
    }

    /// Remove the journal file. Missing is fine.
    pub fn clear(&self) -> Result<(), JournalError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, JournalError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| JournalError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, JournalError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| JournalError::Serialization(e.to_string()))?;
    Ok(value)
}

fn decode_state(payload: &[u8]) -> Option<(Uuid, Uuid, u64, u64, bool, String)> {
    let record: StateRecord = decode(payload).ok()?;
    let raw = lz4_flex::decompress_size_prepended(&record.base_text_lz4).ok()?;
    let base_text = String::from_utf8(raw).ok()?;
    Some((
        record.session_id,
        record.document_id,
        record.server_version,
        record.next_seq,
        record.has_synced,
        base_text,
    ))
}

fn push_frame(buf: &mut Vec<u8>, record: &JournalRecord) -> Result<(), JournalError> {
    let encoded = encode(record)?;
    buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    buf.extend_from_slice(&encoded);
    Ok(())
}
