//! Page cursor: durable consumption bookmarks for one address.
//!
//! Page file deletion is never the signal that messages were consumed.
//! Every acknowledgement of a depaged message is journaled first; when a page
//! has nothing left outstanding a `PageCompleted` record is journaled, then
//! the file is deleted, then the bookmarks are removed. A restart at any
//! point in between replays to the same outcome.
//!
//! Records written under a transaction are only delivered once a
//! `PageTransaction` record for that transaction is committed. A page holding
//! records of a transaction still in flight is not depaged yet; records of a
//! transaction that rolled back, or never committed before a crash, are
//! skipped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use harbormq_storage::{Journal, JournalRecord, Page, PageDirectory, RecordKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::message::{Message, MessageReference};
use crate::queue::{Queue, QueueRegistry};

/// Location of a message in the page files of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PagePosition {
    /// Page number.
    pub page_id: u64,
    /// Record index within the page.
    pub index: u32,
}

/// Attached to references that were depaged.
#[derive(Clone)]
pub struct PagedOrigin {
    /// Where the message lives on disk.
    pub position: PagePosition,
    /// Cursor to acknowledge through.
    pub cursor: Arc<PageCursor>,
}

impl fmt::Debug for PagedOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedOrigin")
            .field("position", &self.position)
            .field("address", &self.cursor.address)
            .finish()
    }
}

/// Journal payload of one queue's acknowledgement of a paged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorAckEntry {
    /// Paged address.
    pub address: String,
    /// Page number.
    pub page_id: u64,
    /// Record index within the page.
    pub index: u32,
    /// Acknowledging queue.
    pub queue_id: u64,
}

/// Journal payload marking a page fully consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCompletedEntry {
    /// Paged address.
    pub address: String,
    /// Page number.
    pub page_id: u64,
}

/// Journal payload marking that a transaction's writes to a page committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTransactionEntry {
    /// Paged address.
    pub address: String,
    /// The writing transaction.
    pub tx_id: u64,
    /// Page the transaction wrote to.
    pub page_id: u64,
}

#[derive(Debug, Default)]
struct PageProgress {
    delivered: bool,
    remaining: usize,
    acked: HashSet<(u64, u32)>,
    ack_records: Vec<u64>,
}

#[derive(Debug, Default)]
struct CursorState {
    pages: HashMap<u64, PageProgress>,
    completed: HashMap<u64, u64>,
    /// Transactions that wrote pages and have not finished; their
    /// `(page_id, record_id)` pairs become live only on commit.
    open_txs: HashMap<u64, Vec<(u64, u64)>>,
    committed_txs: HashSet<u64>,
    /// `(tx_id, record_id)` of committed page transactions, per page.
    tx_records: HashMap<u64, Vec<(u64, u64)>>,
}

impl CursorState {
    fn release_tx_records(&mut self, page_id: u64) -> Vec<u64> {
        let entries = self.tx_records.remove(&page_id).unwrap_or_default();
        for (tx_id, _) in &entries {
            let still_used = self
                .tx_records
                .values()
                .any(|v| v.iter().any(|(t, _)| t == tx_id));
            if !still_used {
                self.committed_txs.remove(tx_id);
            }
        }
        entries.into_iter().map(|(_, record_id)| record_id).collect()
    }
}

/// Outcome of [`PageCursor::deliver_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDelivery {
    /// References handed to queues.
    Delivered(usize),
    /// The page holds writes of a transaction that has not finished.
    InFlight {
        /// The unfinished transaction.
        tx_id: u64,
    },
}

/// Consumption bookmarks of one address.
pub struct PageCursor {
    address: String,
    journal: Arc<dyn Journal>,
    directory: RwLock<Option<PageDirectory>>,
    state: Mutex<CursorState>,
}

impl fmt::Debug for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCursor")
            .field("address", &self.address)
            .field("tracked_pages", &self.state.lock().pages.len())
            .finish()
    }
}

impl PageCursor {
    /// Creates a cursor with no bookmarks.
    pub fn new(address: impl Into<String>, journal: Arc<dyn Journal>) -> Self {
        Self {
            address: address.into(),
            journal,
            directory: RwLock::new(None),
            state: Mutex::new(CursorState::default()),
        }
    }

    /// Address this cursor belongs to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sets the directory whose page files this cursor deletes.
    pub fn attach_directory(&self, directory: PageDirectory) {
        *self.directory.write() = Some(directory);
    }

    /// Pages delivered or bookmarked and not yet deleted.
    pub fn tracked_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Restores bookmarks of this address from journal records.
    pub fn load(&self, records: &[JournalRecord]) -> Result<()> {
        let mut state = self.state.lock();
        for record in records {
            match record.kind {
                RecordKind::PageCursorAck => {
                    let entry: CursorAckEntry = record.decode()?;
                    if entry.address != self.address {
                        continue;
                    }
                    let progress = state.pages.entry(entry.page_id).or_default();
                    progress.acked.insert((entry.queue_id, entry.index));
                    progress.ack_records.push(record.id);
                }
                RecordKind::PageCompleted => {
                    let entry: PageCompletedEntry = record.decode()?;
                    if entry.address == self.address {
                        state.completed.insert(entry.page_id, record.id);
                    }
                }
                RecordKind::PageTransaction => {
                    let entry: PageTransactionEntry = record.decode()?;
                    if entry.address == self.address {
                        state.committed_txs.insert(entry.tx_id);
                        state
                            .tx_records
                            .entry(entry.page_id)
                            .or_default()
                            .push((entry.tx_id, record.id));
                    }
                }
                _ => {}
            }
        }
        debug!(
            address = %self.address,
            pages = state.pages.len(),
            completed = state.completed.len(),
            committed_txs = state.committed_txs.len(),
            "page cursor loaded"
        );
        Ok(())
    }

    /// Finishes deletions interrupted by a restart: pages with a completion
    /// record lose their file and bookmarks. Returns how many were finished.
    pub fn finish_completed(&self) -> Result<usize> {
        let completed: Vec<(u64, u64)> = self.state.lock().completed.drain().collect();
        for &(page_id, record_id) in &completed {
            info!(address = %self.address, page_id, "finishing deletion of completed page");
            self.remove_page(page_id, record_id)?;
        }
        Ok(completed.len())
    }

    /// Drops bookmarks of a page whose file is gone.
    pub fn forget_page(&self, page_id: u64) -> Result<()> {
        let (progress, completed, tx_records) = {
            let mut state = self.state.lock();
            (
                state.pages.remove(&page_id),
                state.completed.remove(&page_id),
                state.release_tx_records(page_id),
            )
        };
        for record_id in progress.map(|p| p.ack_records).unwrap_or_default() {
            self.journal.delete(record_id)?;
        }
        for record_id in tx_records {
            self.journal.delete(record_id)?;
        }
        if let Some(record_id) = completed {
            self.journal.delete(record_id)?;
        }
        Ok(())
    }

    /// Marks `tx_id` as writing to pages; its records are held back until
    /// [`PageCursor::commit_tx`] or [`PageCursor::rollback_tx`].
    pub fn begin_tx(&self, tx_id: u64) {
        self.state.lock().open_txs.entry(tx_id).or_default();
    }

    /// Journals, inside `tx_id`, that the transaction wrote to `page_id`.
    /// The record becomes durable exactly when the transaction commits.
    pub fn record_tx_write(&self, tx_id: u64, page_id: u64) -> Result<()> {
        {
            let state = self.state.lock();
            let seen = state
                .open_txs
                .get(&tx_id)
                .is_some_and(|pages| pages.iter().any(|(p, _)| *p == page_id));
            if seen {
                return Ok(());
            }
        }
        let record_id = self.journal.generate_unique_id();
        let entry = PageTransactionEntry {
            address: self.address.clone(),
            tx_id,
            page_id,
        };
        self.journal.store_transactional(
            tx_id,
            JournalRecord::encode(record_id, RecordKind::PageTransaction, &entry)?,
        )?;
        self.state
            .lock()
            .open_txs
            .entry(tx_id)
            .or_default()
            .push((page_id, record_id));
        Ok(())
    }

    /// Releases the paged records of a committed transaction.
    pub fn commit_tx(&self, tx_id: u64) {
        let mut state = self.state.lock();
        let Some(writes) = state.open_txs.remove(&tx_id) else {
            return;
        };
        for (page_id, record_id) in writes {
            state
                .tx_records
                .entry(page_id)
                .or_default()
                .push((tx_id, record_id));
        }
        state.committed_txs.insert(tx_id);
        debug!(address = %self.address, tx_id, "page transaction committed");
    }

    /// Forgets a rolled-back transaction; its paged records are skipped.
    pub fn rollback_tx(&self, tx_id: u64) {
        if self.state.lock().open_txs.remove(&tx_id).is_some() {
            debug!(address = %self.address, tx_id, "page transaction rolled back");
        }
    }

    /// Reads `page` and hands every record not yet acknowledged to its
    /// queues. Nothing is delivered while a writer transaction is unfinished.
    pub fn deliver_page(self: &Arc<Self>, page: &Page, queues: &QueueRegistry) -> Result<PageDelivery> {
        let page_id = page.page_id();
        let records = page.read()?;
        let (acked, committed) = {
            let state = self.state.lock();
            if let Some(tx_id) = records
                .iter()
                .filter_map(|r| r.tx_id)
                .find(|tx_id| state.open_txs.contains_key(tx_id))
            {
                debug!(address = %self.address, page_id, tx_id, "page waits for transaction");
                return Ok(PageDelivery::InFlight { tx_id });
            }
            let acked: HashSet<(u64, u32)> = state
                .pages
                .get(&page_id)
                .map(|p| p.acked.clone())
                .unwrap_or_default();
            (acked, state.committed_txs.clone())
        };

        let mut deliveries: Vec<(Arc<Queue>, MessageReference)> = Vec::new();
        let mut skipped = 0;
        for (index, record) in records.iter().enumerate() {
            let index = index as u32;
            if let Some(tx_id) = record.tx_id {
                if !committed.contains(&tx_id) {
                    skipped += 1;
                    continue;
                }
            }
            let message: Arc<Message> = Arc::new(bincode::deserialize(&record.body)?);
            for &queue_id in &record.queue_ids {
                if acked.contains(&(queue_id, index)) {
                    continue;
                }
                let Some(queue) = queues.get(queue_id) else {
                    debug!(address = %self.address, page_id, queue_id, "paged queue no longer exists");
                    continue;
                };
                let mut reference = MessageReference::new(Arc::clone(&message), queue_id);
                reference.paged = Some(PagedOrigin {
                    position: PagePosition { page_id, index },
                    cursor: Arc::clone(self),
                });
                deliveries.push((queue, reference));
            }
        }

        {
            let mut state = self.state.lock();
            let progress = state.pages.entry(page_id).or_default();
            progress.delivered = true;
            progress.remaining = deliveries.len();
        }
        let delivered = deliveries.len();
        debug!(address = %self.address, page_id, delivered, skipped, "page delivered");
        if delivered == 0 {
            self.complete_page(page_id)?;
            return Ok(PageDelivery::Delivered(0));
        }
        for (queue, reference) in deliveries {
            queue.add_reference(reference);
        }
        Ok(PageDelivery::Delivered(delivered))
    }

    /// Journals that `queue_id` consumed the message at `position`, and
    /// completes the page when it was the last one outstanding.
    pub fn ack(&self, position: PagePosition, queue_id: u64) -> Result<()> {
        let record_id = self.journal.generate_unique_id();
        let entry = CursorAckEntry {
            address: self.address.clone(),
            page_id: position.page_id,
            index: position.index,
            queue_id,
        };
        self.journal
            .store(JournalRecord::encode(record_id, RecordKind::PageCursorAck, &entry)?)?;

        let done = {
            let mut state = self.state.lock();
            let progress = state.pages.entry(position.page_id).or_default();
            progress.acked.insert((queue_id, position.index));
            progress.ack_records.push(record_id);
            progress.remaining = progress.remaining.saturating_sub(1);
            progress.delivered && progress.remaining == 0
        };
        if done {
            self.complete_page(position.page_id)?;
        }
        Ok(())
    }

    fn complete_page(&self, page_id: u64) -> Result<()> {
        let record_id = self.journal.generate_unique_id();
        let entry = PageCompletedEntry {
            address: self.address.clone(),
            page_id,
        };
        self.journal
            .store(JournalRecord::encode(record_id, RecordKind::PageCompleted, &entry)?)?;
        self.remove_page(page_id, record_id)
    }

    fn remove_page(&self, page_id: u64, completed_record: u64) -> Result<()> {
        let directory = self.directory.read().clone();
        if let Some(directory) = directory {
            directory.delete_page(page_id)?;
            let first = directory
                .page_ids()?
                .first()
                .copied()
                .unwrap_or(page_id + 1);
            directory.write_first_page(first)?;
        }
        let (progress, tx_records) = {
            let mut state = self.state.lock();
            (state.pages.remove(&page_id), state.release_tx_records(page_id))
        };
        for record_id in progress.map(|p| p.ack_records).unwrap_or_default() {
            self.journal.delete(record_id)?;
        }
        for record_id in tx_records {
            self.journal.delete(record_id)?;
        }
        self.journal.delete(completed_record)?;
        info!(address = %self.address, page_id, "page consumed and deleted");
        Ok(())
    }
}
