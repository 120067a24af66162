//! Append-only journal: the durable store behind messages, duplicate ids,
//! grouping decisions and page cursor bookmarks.
//!
//! Every mutation is a [`JournalOp`]. Replaying the ops of a journal in order
//! rebuilds the set of live records; transactional ops become visible only
//! when their transaction's `Commit` is replayed, and transactions that never
//! committed are discarded.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::frame::{decode_frames, encode_frame};
use crate::mirror::ReplicationMirror;

/// What a journal record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A durable message body plus the queues it was routed to.
    Message,
    /// A queue acknowledged a durable message.
    Acknowledgement,
    /// A duplicate-detection identifier for an address.
    DuplicateId,
    /// A group id pinned to a cluster binding.
    GroupBinding,
    /// A queue consumed one position of a page.
    PageCursorAck,
    /// Every queue finished with a page; the file may be deleted.
    PageCompleted,
    /// A transaction that wrote to a page committed.
    PageTransaction,
    /// A durable queue and its binding.
    QueueBinding,
}

/// A single live record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Unique record ID.
    pub id: u64,
    /// Record kind.
    pub kind: RecordKind,
    /// Bincode-encoded body.
    pub payload: Vec<u8>,
}

impl JournalRecord {
    /// Creates a record from raw payload bytes.
    pub fn new(id: u64, kind: RecordKind, payload: Vec<u8>) -> Self {
        Self { id, kind, payload }
    }

    /// Creates a record by bincode-encoding `value`.
    pub fn encode<T: Serialize>(id: u64, kind: RecordKind, value: &T) -> StorageResult<Self> {
        Ok(Self::new(id, kind, bincode::serialize(value)?))
    }

    /// Decodes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// One journal mutation, as written to disk and as mirrored to a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Non-transactional add.
    Add(JournalRecord),
    /// Add that becomes visible when `tx_id` commits.
    AddTransactional {
        /// Owning transaction.
        tx_id: u64,
        /// The record.
        record: JournalRecord,
    },
    /// Non-transactional delete.
    Delete {
        /// Record to delete.
        record_id: u64,
    },
    /// Delete applied when `tx_id` commits.
    DeleteTransactional {
        /// Owning transaction.
        tx_id: u64,
        /// Record to delete.
        record_id: u64,
    },
    /// Commit all pending ops of a transaction.
    Commit {
        /// Transaction being committed.
        tx_id: u64,
    },
    /// Discard all pending ops of a transaction.
    Rollback {
        /// Transaction being rolled back.
        tx_id: u64,
    },
}

impl JournalOp {
    fn needs_sync(&self) -> bool {
        matches!(
            self,
            JournalOp::Add(_) | JournalOp::Delete { .. } | JournalOp::Commit { .. }
        )
    }
}

/// The durable store contract used by the broker.
pub trait Journal: Send + Sync {
    /// Returns a new ID, unique across records and transactions.
    fn generate_unique_id(&self) -> u64;

    /// Durably adds a record.
    fn store(&self, record: JournalRecord) -> StorageResult<()>;

    /// Adds a record that becomes visible when `tx_id` commits.
    fn store_transactional(&self, tx_id: u64, record: JournalRecord) -> StorageResult<()>;

    /// Durably deletes a record.
    fn delete(&self, record_id: u64) -> StorageResult<()>;

    /// Deletes a record when `tx_id` commits.
    fn delete_transactional(&self, tx_id: u64, record_id: u64) -> StorageResult<()>;

    /// Commits the pending ops of `tx_id`.
    fn commit(&self, tx_id: u64) -> StorageResult<()>;

    /// Discards the pending ops of `tx_id`.
    fn rollback(&self, tx_id: u64) -> StorageResult<()>;

    /// Live, committed records ordered by ID.
    fn records(&self) -> Vec<JournalRecord>;

    /// Applies an already-encoded op verbatim, as a backup replica does.
    fn apply(&self, op: JournalOp) -> StorageResult<()>;

    /// Installs (or clears) the mirror that observes every applied op.
    fn set_mirror(&self, mirror: Option<Arc<dyn ReplicationMirror>>);
}

/// A pending transactional mutation.
#[derive(Debug, Clone)]
enum PendingOp {
    Add(JournalRecord),
    Delete(u64),
}

/// Replay state shared by every journal backend.
#[derive(Debug, Default)]
struct JournalState {
    records: BTreeMap<u64, JournalRecord>,
    pending: HashMap<u64, Vec<PendingOp>>,
    highest_id: u64,
}

impl JournalState {
    fn validate(&self, op: &JournalOp) -> StorageResult<()> {
        match op {
            JournalOp::Add(record) => {
                if self.records.contains_key(&record.id) {
                    return Err(StorageError::DuplicateRecord {
                        record_id: record.id,
                    });
                }
            }
            JournalOp::Delete { record_id } => {
                if !self.records.contains_key(record_id) {
                    return Err(StorageError::RecordNotFound {
                        record_id: *record_id,
                    });
                }
            }
            JournalOp::DeleteTransactional { tx_id, record_id } => {
                let pending_add = self.pending.get(tx_id).is_some_and(|ops| {
                    ops.iter()
                        .any(|p| matches!(p, PendingOp::Add(r) if r.id == *record_id))
                });
                if !pending_add && !self.records.contains_key(record_id) {
                    return Err(StorageError::RecordNotFound {
                        record_id: *record_id,
                    });
                }
            }
            JournalOp::AddTransactional { .. }
            | JournalOp::Commit { .. }
            | JournalOp::Rollback { .. } => {}
        }
        Ok(())
    }

    fn apply(&mut self, op: &JournalOp) {
        match op {
            JournalOp::Add(record) => {
                self.bump(record.id);
                self.records.insert(record.id, record.clone());
            }
            JournalOp::AddTransactional { tx_id, record } => {
                self.bump(*tx_id);
                self.bump(record.id);
                self.pending
                    .entry(*tx_id)
                    .or_default()
                    .push(PendingOp::Add(record.clone()));
            }
            JournalOp::Delete { record_id } => {
                self.records.remove(record_id);
            }
            JournalOp::DeleteTransactional { tx_id, record_id } => {
                self.bump(*tx_id);
                self.pending
                    .entry(*tx_id)
                    .or_default()
                    .push(PendingOp::Delete(*record_id));
            }
            JournalOp::Commit { tx_id } => {
                self.bump(*tx_id);
                for pending in self.pending.remove(tx_id).unwrap_or_default() {
                    match pending {
                        PendingOp::Add(record) => {
                            self.records.insert(record.id, record);
                        }
                        PendingOp::Delete(record_id) => {
                            if self.records.remove(&record_id).is_none() {
                                debug!(tx_id, record_id, "committed delete of absent record");
                            }
                        }
                    }
                }
            }
            JournalOp::Rollback { tx_id } => {
                self.bump(*tx_id);
                self.pending.remove(tx_id);
            }
        }
    }

    fn bump(&mut self, id: u64) {
        self.highest_id = self.highest_id.max(id);
    }

    fn live_records(&self) -> Vec<JournalRecord> {
        self.records.values().cloned().collect()
    }

    /// Ops that reproduce the current state, used for compaction.
    fn snapshot_ops(&self) -> Vec<JournalOp> {
        let mut ops: Vec<JournalOp> = self.records.values().cloned().map(JournalOp::Add).collect();
        let mut tx_ids: Vec<_> = self.pending.keys().copied().collect();
        tx_ids.sort_unstable();
        for tx_id in tx_ids {
            for pending in &self.pending[&tx_id] {
                ops.push(match pending {
                    PendingOp::Add(record) => JournalOp::AddTransactional {
                        tx_id,
                        record: record.clone(),
                    },
                    PendingOp::Delete(record_id) => JournalOp::DeleteTransactional {
                        tx_id,
                        record_id: *record_id,
                    },
                });
            }
        }
        ops
    }
}

/// Volatile journal used by tests and by non-persistent backups.
pub struct InMemoryJournal {
    state: Mutex<JournalState>,
    next_id: AtomicU64,
    mirror: RwLock<Option<Arc<dyn ReplicationMirror>>>,
}

impl InMemoryJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JournalState::default()),
            next_id: AtomicU64::new(1),
            mirror: RwLock::new(None),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if no record is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn submit(&self, op: JournalOp) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.validate(&op)?;
        state.apply(&op);
        self.next_id
            .fetch_max(state.highest_id + 1, Ordering::SeqCst);
        if let Some(mirror) = self.mirror.read().as_ref() {
            mirror.journal_op(&op);
        }
        Ok(())
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for InMemoryJournal {
    fn generate_unique_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn store(&self, record: JournalRecord) -> StorageResult<()> {
        self.submit(JournalOp::Add(record))
    }

    fn store_transactional(&self, tx_id: u64, record: JournalRecord) -> StorageResult<()> {
        self.submit(JournalOp::AddTransactional { tx_id, record })
    }

    fn delete(&self, record_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::Delete { record_id })
    }

    fn delete_transactional(&self, tx_id: u64, record_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::DeleteTransactional { tx_id, record_id })
    }

    fn commit(&self, tx_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::Commit { tx_id })
    }

    fn rollback(&self, tx_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::Rollback { tx_id })
    }

    fn records(&self) -> Vec<JournalRecord> {
        self.state.lock().live_records()
    }

    fn apply(&self, op: JournalOp) -> StorageResult<()> {
        self.submit(op)
    }

    fn set_mirror(&self, mirror: Option<Arc<dyn ReplicationMirror>>) {
        *self.mirror.write() = mirror;
    }
}

/// Configuration for the file journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileJournalConfig {
    /// Path of the journal file.
    pub path: PathBuf,
    /// fsync after commits and non-transactional store/delete.
    pub sync_on_commit: bool,
}

impl FileJournalConfig {
    /// Creates a config for `path` with syncing enabled.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_on_commit: true,
        }
    }
}

/// Statistics for the file journal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileJournalStats {
    /// Ops appended since open.
    pub ops_appended: u64,
    /// Bytes appended since open.
    pub bytes_written: u64,
    /// Ops replayed at open.
    pub ops_replayed: u64,
    /// Torn bytes truncated at open.
    pub torn_bytes_truncated: u64,
    /// Compactions performed.
    pub compactions: u64,
}

struct FileJournalInner {
    file: File,
    state: JournalState,
    file_len: u64,
    stats: FileJournalStats,
}

/// Append-only, crash-safe journal file.
pub struct FileJournal {
    config: FileJournalConfig,
    inner: Mutex<FileJournalInner>,
    next_id: AtomicU64,
    mirror: RwLock<Option<Arc<dyn ReplicationMirror>>>,
}

impl FileJournal {
    /// Opens (or creates) the journal file and replays it.
    pub fn open(config: FileJournalConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut data = Vec::new();
        if config.path.exists() {
            File::open(&config.path)?.read_to_end(&mut data)?;
        }

        let decoded = decode_frames(&data);
        let mut state = JournalState::default();
        let mut stats = FileJournalStats::default();
        for frame in &decoded.frames {
            let op: JournalOp = bincode::deserialize(frame)?;
            state.apply(&op);
            stats.ops_replayed += 1;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        if decoded.is_torn(data.len()) {
            let torn = (data.len() - decoded.valid_len) as u64;
            warn!(
                path = %config.path.display(),
                valid_len = decoded.valid_len,
                torn_bytes = torn,
                "truncating torn journal tail"
            );
            file.set_len(decoded.valid_len as u64)?;
            stats.torn_bytes_truncated = torn;
        }

        info!(
            path = %config.path.display(),
            ops_replayed = stats.ops_replayed,
            live_records = state.records.len(),
            pending_transactions = state.pending.len(),
            "journal opened"
        );

        let next_id = state.highest_id + 1;
        Ok(Self {
            config,
            inner: Mutex::new(FileJournalInner {
                file,
                state,
                file_len: decoded.valid_len as u64,
                stats,
            }),
            next_id: AtomicU64::new(next_id),
            mirror: RwLock::new(None),
        })
    }

    /// Returns a snapshot of journal statistics.
    pub fn stats(&self) -> FileJournalStats {
        self.inner.lock().stats.clone()
    }

    /// Current file length in bytes.
    pub fn file_len(&self) -> u64 {
        self.inner.lock().file_len
    }

    /// Rewrites the file with only the live records and pending transactions.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn compact(&self) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let tmp_path = self.config.path.with_extension("compact");

        let mut buf = Vec::new();
        for op in inner.state.snapshot_ops() {
            buf.extend(encode_frame(&bincode::serialize(&op)?));
        }
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.config.path)?;

        inner.file = OpenOptions::new().append(true).open(&self.config.path)?;
        let reclaimed = inner.file_len.saturating_sub(buf.len() as u64);
        inner.file_len = buf.len() as u64;
        inner.stats.compactions += 1;

        info!(
            path = %self.config.path.display(),
            reclaimed_bytes = reclaimed,
            new_len = inner.file_len,
            "journal compacted"
        );
        Ok(reclaimed)
    }

    fn submit(&self, op: JournalOp) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.state.validate(&op)?;

        let frame = encode_frame(&bincode::serialize(&op)?);
        inner.file.write_all(&frame)?;
        if self.config.sync_on_commit && op.needs_sync() {
            inner.file.sync_data()?;
        }

        inner.state.apply(&op);
        inner.file_len += frame.len() as u64;
        inner.stats.ops_appended += 1;
        inner.stats.bytes_written += frame.len() as u64;
        self.next_id
            .fetch_max(inner.state.highest_id + 1, Ordering::SeqCst);

        if let Some(mirror) = self.mirror.read().as_ref() {
            mirror.journal_op(&op);
        }
        Ok(())
    }
}

impl Journal for FileJournal {
    fn generate_unique_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn store(&self, record: JournalRecord) -> StorageResult<()> {
        self.submit(JournalOp::Add(record))
    }

    fn store_transactional(&self, tx_id: u64, record: JournalRecord) -> StorageResult<()> {
        self.submit(JournalOp::AddTransactional { tx_id, record })
    }

    fn delete(&self, record_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::Delete { record_id })
    }

    fn delete_transactional(&self, tx_id: u64, record_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::DeleteTransactional { tx_id, record_id })
    }

    fn commit(&self, tx_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::Commit { tx_id })
    }

    fn rollback(&self, tx_id: u64) -> StorageResult<()> {
        self.submit(JournalOp::Rollback { tx_id })
    }

    fn records(&self) -> Vec<JournalRecord> {
        self.inner.lock().state.live_records()
    }

    fn apply(&self, op: JournalOp) -> StorageResult<()> {
        self.submit(op)
    }

    fn set_mirror(&self, mirror: Option<Arc<dyn ReplicationMirror>>) {
        *self.mirror.write() = mirror;
    }
}
