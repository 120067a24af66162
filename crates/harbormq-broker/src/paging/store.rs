//! Per-address paging store.
//!
//! The store keeps the address memory estimate and decides, per message,
//! whether it goes straight to the queues or into a page file. Once paging
//! starts every later message is paged too, so delivery order is preserved,
//! until depaging has drained every page.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use harbormq_storage::{
    Page, PageDirectory, PageRecord, ReplicationMirror, StorageError, StorageResult, Transaction,
    TransactionOperation,
};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{AddressFullPolicy, AddressSettings};
use crate::error::{BrokerError, Result};
use crate::executor::Executor;
use crate::message::Message;
use crate::paging::cursor::{PageCursor, PageDelivery};
use crate::paging::manager::GlobalSize;
use crate::queue::QueueRegistry;

/// What [`PagingStore::page`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The store is not paging; deliver directly.
    NotPaged,
    /// Written to a page file (or scheduled to be at commit).
    Paged,
    /// Discarded by the drop policy.
    Dropped,
}

#[derive(Debug)]
struct PageState {
    directory: Option<PageDirectory>,
    current: Option<Page>,
    next_page_id: u64,
    sealed: VecDeque<u64>,
}

/// Paging state of one address.
pub struct PagingStore {
    address: String,
    settings: AddressSettings,
    root: PathBuf,
    size: AtomicI64,
    paging: AtomicBool,
    depaging: AtomicBool,
    pages: Mutex<PageState>,
    cursor: Arc<PageCursor>,
    global: Arc<GlobalSize>,
    queues: Weak<QueueRegistry>,
    executor: Arc<dyn Executor>,
    mirror: RwLock<Option<Arc<dyn ReplicationMirror>>>,
    space: Mutex<()>,
    space_freed: Condvar,
}

impl fmt::Debug for PagingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagingStore")
            .field("address", &self.address)
            .field("size", &self.size())
            .field("paging", &self.is_paging())
            .field("depaging", &self.is_depaging())
            .finish()
    }
}

impl PagingStore {
    pub(crate) fn new(
        address: String,
        settings: AddressSettings,
        root: PathBuf,
        cursor: Arc<PageCursor>,
        global: Arc<GlobalSize>,
        queues: Weak<QueueRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            address,
            settings,
            root,
            size: AtomicI64::new(0),
            paging: AtomicBool::new(false),
            depaging: AtomicBool::new(false),
            pages: Mutex::new(PageState {
                directory: None,
                current: None,
                next_page_id: 1,
                sealed: VecDeque::new(),
            }),
            cursor,
            global,
            queues,
            executor,
            mirror: RwLock::new(None),
            space: Mutex::new(()),
            space_freed: Condvar::new(),
        }
    }

    /// Address of this store.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Effective settings.
    pub fn settings(&self) -> &AddressSettings {
        &self.settings
    }

    /// Memory estimate of messages held in queues.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    /// True while new messages go to page files.
    pub fn is_paging(&self) -> bool {
        self.paging.load(Ordering::Acquire)
    }

    /// True while a depage task runs.
    pub fn is_depaging(&self) -> bool {
        self.depaging.load(Ordering::Acquire)
    }

    /// Consumption bookmarks of this address.
    pub fn cursor(&self) -> &Arc<PageCursor> {
        &self.cursor
    }

    /// Pages waiting to be depaged, the open one included.
    pub fn page_count(&self) -> usize {
        let pages = self.pages.lock();
        pages.sealed.len() + usize::from(pages.current.is_some())
    }

    /// True when the address or the global budget is exhausted.
    pub fn is_full(&self) -> bool {
        let max = self.settings.max_size_bytes;
        (max > 0 && self.size() >= max) || self.global.is_full()
    }

    /// Adjusts the memory estimate. Releasing memory may start depaging and
    /// wakes producers blocked on a full address.
    pub fn add_size(self: &Arc<Self>, delta: i64) {
        if delta == 0 {
            return;
        }
        let size = self.size.fetch_add(delta, Ordering::AcqRel) + delta;
        self.global.add(delta);
        if delta > 0 {
            return;
        }
        if size < 0 {
            warn!(address = %self.address, size, "address size went negative");
        }
        if self.is_paging() && !self.is_full() {
            self.start_depaging();
        }
        if self.settings.address_full_policy == AddressFullPolicy::Block {
            let _guard = self.space.lock();
            self.space_freed.notify_all();
        }
    }

    /// Applies the address-full policy to `message`.
    ///
    /// With `tx` the page write happens just before the journal commit,
    /// together with a transactional `PageTransaction` record; the cursor
    /// delivers the message only once that record is committed. The caller
    /// must not deliver the message itself when `Paged` is returned.
    pub fn page(
        self: &Arc<Self>,
        message: &Message,
        queue_ids: &[u64],
        tx: Option<&mut Transaction>,
    ) -> Result<PageOutcome> {
        match self.settings.address_full_policy {
            AddressFullPolicy::Page => {}
            AddressFullPolicy::Drop => {
                if self.is_full() {
                    debug!(address = %self.address, message_id = message.message_id, "address full, message dropped");
                    return Ok(PageOutcome::Dropped);
                }
                return Ok(PageOutcome::NotPaged);
            }
            AddressFullPolicy::Fail => {
                if self.is_full() {
                    return Err(self.full_error());
                }
                return Ok(PageOutcome::NotPaged);
            }
            AddressFullPolicy::Block => {
                self.wait_for_space()?;
                return Ok(PageOutcome::NotPaged);
            }
        }

        if !self.is_paging() && !self.is_full() {
            return Ok(PageOutcome::NotPaged);
        }
        let record = PageRecord {
            message_id: message.message_id,
            address: self.address.clone(),
            queue_ids: queue_ids.to_vec(),
            tx_id: tx.as_ref().map(|tx| tx.id()),
            body: bincode::serialize(message)?,
        };
        match tx {
            Some(tx) => {
                tx.add_operation(Box::new(PageWriteOperation {
                    store: Arc::clone(self),
                    record: Some(record),
                    durable: message.durable,
                }));
                tx.set_contains_persistent();
                Ok(PageOutcome::Paged)
            }
            None => {
                let mut pages = self.pages.lock();
                if !self.is_paging() && !self.is_full() {
                    return Ok(PageOutcome::NotPaged);
                }
                self.write_locked(&mut pages, &record, message.durable)?;
                Ok(PageOutcome::Paged)
            }
        }
    }

    fn full_error(&self) -> BrokerError {
        BrokerError::AddressFull {
            address: self.address.clone(),
            size: self.size(),
            max_size: self.settings.max_size_bytes,
        }
    }

    fn wait_for_space(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.settings.block_timeout_ms);
        let mut guard = self.space.lock();
        while self.is_full() {
            if self.space_freed.wait_until(&mut guard, deadline).timed_out() && self.is_full() {
                warn!(address = %self.address, timeout_ms = self.settings.block_timeout_ms, "producer blocked too long on full address");
                return Err(self.full_error());
            }
        }
        Ok(())
    }

    /// Appends `record` to the open page and returns that page's number.
    fn write_locked(&self, pages: &mut PageState, record: &PageRecord, durable: bool) -> Result<u64> {
        if !self.is_paging() {
            self.start_paging_locked(pages)?;
        }
        let Some(directory) = pages.directory.clone() else {
            return Err(BrokerError::IllegalState(format!(
                "address {} is paging without a page directory",
                self.address
            )));
        };
        if pages.current.is_none() {
            let page_id = pages.next_page_id;
            pages.next_page_id += 1;
            let mut page = directory.page(page_id);
            page.open()?;
            debug!(address = %self.address, page_id, "new page");
            pages.current = Some(page);
        }
        let Some(page) = pages.current.as_mut() else {
            return Err(BrokerError::IllegalState(format!(
                "address {} has no open page",
                self.address
            )));
        };
        page.write(record)?;
        if durable {
            page.sync()?;
        }
        let page_id = page.page_id();
        if page.size() >= self.settings.page_size_bytes {
            Self::seal_locked(pages)?;
        }
        Ok(page_id)
    }

    fn start_paging_locked(&self, pages: &mut PageState) -> Result<()> {
        if pages.directory.is_none() {
            let mut directory = PageDirectory::find_or_create(&self.root, &self.address)?;
            directory.set_mirror(self.mirror.read().clone());
            if directory.read_first_page()?.is_none() {
                directory.write_first_page(pages.next_page_id)?;
            }
            self.cursor.attach_directory(directory.clone());
            pages.directory = Some(directory);
        }
        self.paging.store(true, Ordering::Release);
        info!(address = %self.address, size = self.size(), max_size = self.settings.max_size_bytes, "paging started");
        Ok(())
    }

    fn seal_locked(pages: &mut PageState) -> StorageResult<()> {
        if let Some(mut page) = pages.current.take() {
            page.close()?;
            pages.sealed.push_back(page.page_id());
        }
        Ok(())
    }

    /// Takes the oldest page off the write queue. The file stays on disk
    /// until the cursor has seen every message in it consumed.
    ///
    /// Returns `None` once nothing is left, which also ends paging.
    pub fn depage(&self) -> Result<Option<Page>> {
        let mut pages = self.pages.lock();
        if pages.sealed.is_empty() {
            let has_records = pages
                .current
                .as_ref()
                .map(|p| p.size() > harbormq_storage::PAGE_HEADER_LEN)
                .unwrap_or(false);
            if has_records {
                Self::seal_locked(&mut pages)?;
            }
        }
        if let Some(page_id) = pages.sealed.pop_front() {
            let Some(directory) = pages.directory.as_ref() else {
                return Ok(None);
            };
            return Ok(Some(directory.page(page_id)));
        }
        if let Some(mut empty) = pages.current.take() {
            empty.delete()?;
        }
        if self.paging.swap(false, Ordering::AcqRel) {
            info!(address = %self.address, size = self.size(), "paging stopped");
        }
        Ok(None)
    }

    /// Schedules a depage task on the executor; false if one is running or
    /// the store is not paging.
    pub fn start_depaging(self: &Arc<Self>) -> bool {
        if !self.is_paging() {
            return false;
        }
        if self
            .depaging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let store = Arc::clone(self);
        self.executor.execute(Box::new(move || store.run_depage()));
        true
    }

    fn run_depage(self: &Arc<Self>) {
        loop {
            let result = self.depage_while_room();
            self.depaging.store(false, Ordering::Release);
            match result {
                Ok(true) => {}
                // held by an open transaction
                Ok(false) => return,
                Err(e) => {
                    warn!(address = %self.address, error = %e, "depaging failed");
                    return;
                }
            }
            // a release may have been missed while the flag was set
            if !self.is_paging() || self.is_full() {
                return;
            }
            if self
                .depaging
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    /// Delivers pages while memory allows. Returns false when depaging has
    /// to wait, as for a page held by a transaction that has not finished.
    fn depage_while_room(&self) -> Result<bool> {
        while !self.is_full() {
            let Some(page) = self.depage()? else {
                break;
            };
            let Some(queues) = self.queues.upgrade() else {
                return Ok(false);
            };
            match self.cursor.deliver_page(&page, &queues) {
                Ok(PageDelivery::Delivered(_)) => {}
                Ok(PageDelivery::InFlight { tx_id }) => {
                    // resumed by the transaction's commit or rollback
                    self.pages.lock().sealed.push_front(page.page_id());
                    debug!(address = %self.address, page_id = page.page_id(), tx_id, "page held by open transaction");
                    return Ok(false);
                }
                Err(e) => {
                    self.pages.lock().sealed.push_front(page.page_id());
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Restores paging state from `directory` after a restart.
    ///
    /// Pages below the first-page marker are leftovers of completed pages
    /// and are deleted; the rest are queued for depaging.
    pub fn reload(&self, mut directory: PageDirectory) -> Result<()> {
        directory.set_mirror(self.mirror.read().clone());
        let first = directory.read_first_page()?.unwrap_or(1);
        let mut remaining = Vec::new();
        for page_id in directory.page_ids()? {
            if page_id < first {
                info!(address = %self.address, page_id, first, "deleting page below first-page marker");
                directory.delete_page(page_id)?;
                self.cursor.forget_page(page_id)?;
            } else {
                remaining.push(page_id);
            }
        }

        let mut pages = self.pages.lock();
        pages.next_page_id = remaining.last().map(|id| id + 1).unwrap_or(1).max(first);
        pages.sealed = remaining.into_iter().collect();
        pages.current = None;
        self.cursor.attach_directory(directory.clone());
        pages.directory = Some(directory);
        if !pages.sealed.is_empty() {
            self.paging.store(true, Ordering::Release);
            info!(address = %self.address, pages = pages.sealed.len(), "paged address reloaded");
        }
        Ok(())
    }

    /// Mirrors page writes of this store to a backup.
    pub fn set_mirror(&self, mirror: Option<Arc<dyn ReplicationMirror>>) {
        *self.mirror.write() = mirror.clone();
        let mut pages = self.pages.lock();
        if let Some(directory) = pages.directory.as_mut() {
            directory.set_mirror(mirror);
            self.cursor.attach_directory(directory.clone());
        }
        // the open page keeps its old handle; the next page picks up the mirror
        if let Err(e) = Self::seal_locked(&mut pages) {
            warn!(address = %self.address, error = %e, "failed to seal page on mirror change");
        }
    }
}

struct PageWriteOperation {
    store: Arc<PagingStore>,
    record: Option<PageRecord>,
    durable: bool,
}

impl TransactionOperation for PageWriteOperation {
    fn before_commit(&mut self, tx_id: u64) -> StorageResult<()> {
        let Some(record) = self.record.take() else {
            return Ok(());
        };
        let cursor = Arc::clone(&self.store.cursor);
        cursor.begin_tx(tx_id);
        let page_id = {
            let mut pages = self.store.pages.lock();
            self.store
                .write_locked(&mut pages, &record, self.durable)
                .map_err(into_storage_error)?
        };
        cursor
            .record_tx_write(tx_id, page_id)
            .map_err(into_storage_error)?;
        debug!(address = %self.store.address, tx_id, page_id, message_id = record.message_id, "transactional page write");
        Ok(())
    }

    fn after_commit(&mut self, tx_id: u64) {
        self.store.cursor.commit_tx(tx_id);
        if !self.store.is_full() {
            self.store.start_depaging();
        }
    }

    fn after_rollback(&mut self, tx_id: u64) {
        self.store.cursor.rollback_tx(tx_id);
        if !self.store.is_full() {
            self.store.start_depaging();
        }
    }
}

fn into_storage_error(e: BrokerError) -> StorageError {
    match e {
        BrokerError::Storage(e) => e,
        other => StorageError::IoError(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DirectExecutor;
    use crate::message::MessageReference;
    use crate::paging::{PagingManager, PagingManagerConfig};
    use crate::persistence::MessagePersistence;
    use crate::queue::Queue;
    use harbormq_storage::{InMemoryJournal, Journal, RecordKind};
    use std::collections::HashMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        journal: Arc<InMemoryJournal>,
        paging: PagingManager,
        registry: Arc<QueueRegistry>,
    }

    fn fixture(settings: AddressSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(InMemoryJournal::new());
        let registry = Arc::new(QueueRegistry::new());
        let paging = PagingManager::new(
            PagingManagerConfig {
                root: dir.path().join("paging"),
                global_max_size: -1,
                default_settings: settings,
                overrides: HashMap::new(),
            },
            journal.clone(),
            Arc::new(DirectExecutor),
            &registry,
        );
        Fixture {
            _dir: dir,
            journal,
            paging,
            registry,
        }
    }

    fn message(journal: &InMemoryJournal) -> Message {
        let mut message = Message::new("a", vec![0u8; 100]);
        message.message_id = journal.generate_unique_id();
        message
    }

    fn small(policy: AddressFullPolicy) -> AddressSettings {
        AddressSettings {
            max_size_bytes: 1_000,
            page_size_bytes: 1_024,
            address_full_policy: policy,
            block_timeout_ms: 50,
            ..AddressSettings::default()
        }
    }

    #[test]
    fn test_not_paging_below_max() {
        let fx = fixture(small(AddressFullPolicy::Page));
        let store = fx.paging.get_or_create("a");
        let m = message(&fx.journal);
        assert_eq!(store.page(&m, &[1], None).unwrap(), PageOutcome::NotPaged);
        assert!(!store.is_paging());
    }

    #[test]
    fn test_pages_when_full_and_depages_on_release() {
        let fx = fixture(small(AddressFullPolicy::Page));
        let store = fx.paging.get_or_create("a");
        let persistence = Arc::new(MessagePersistence::new(fx.journal.clone()));
        let queue = Arc::new(Queue::new(1, "q1", "a", false, persistence, store.clone()));
        fx.registry.insert(queue.clone()).unwrap();

        let mut held = Vec::new();
        while !store.is_full() {
            let m = message(&fx.journal);
            held.push(m.message_id);
            queue.add_reference(MessageReference::new(Arc::new(m), 1));
        }
        for _ in 0..3 {
            let m = message(&fx.journal);
            assert_eq!(store.page(&m, &[1], None).unwrap(), PageOutcome::Paged);
        }
        assert!(store.is_paging());
        assert_eq!(queue.message_count(), held.len());

        let consumer = queue.add_consumer();
        let mut seen = 0;
        while let Some(r) = queue.poll(consumer).unwrap() {
            queue.acknowledge(r.message_id()).unwrap();
            seen += 1;
        }
        assert_eq!(seen, held.len() + 3);
        assert!(!store.is_paging());
        assert_eq!(store.page_count(), 0);
        assert!(fx.journal.records().is_empty());
    }

    #[test]
    fn test_page_rolls_over_at_page_size() {
        let fx = fixture(AddressSettings {
            max_size_bytes: 1,
            page_size_bytes: 300,
            ..AddressSettings::default()
        });
        let store = fx.paging.get_or_create("a");
        store.add_size(10);
        for _ in 0..6 {
            let m = message(&fx.journal);
            store.page(&m, &[1], None).unwrap();
        }
        assert!(store.page_count() >= 2);
    }

    #[test]
    fn test_drop_and_fail_policies() {
        let fx = fixture(small(AddressFullPolicy::Drop));
        let store = fx.paging.get_or_create("a");
        store.add_size(2_000);
        let m = message(&fx.journal);
        assert_eq!(store.page(&m, &[1], None).unwrap(), PageOutcome::Dropped);
        assert!(!store.is_paging());

        let fx = fixture(small(AddressFullPolicy::Fail));
        let store = fx.paging.get_or_create("a");
        store.add_size(2_000);
        let err = store.page(&m, &[1], None).unwrap_err();
        assert!(matches!(err, BrokerError::AddressFull { size: 2_000, max_size: 1_000, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_block_policy_times_out() {
        let fx = fixture(small(AddressFullPolicy::Block));
        let store = fx.paging.get_or_create("a");
        store.add_size(2_000);
        let m = message(&fx.journal);
        let started = Instant::now();
        assert!(matches!(
            store.page(&m, &[1], None),
            Err(BrokerError::AddressFull { .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_block_policy_wakes_on_release() {
        let fx = fixture(AddressSettings {
            block_timeout_ms: 5_000,
            ..small(AddressFullPolicy::Block)
        });
        let store = fx.paging.get_or_create("a");
        store.add_size(2_000);
        let releaser = {
            let store = store.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                store.add_size(-1_500);
            })
        };
        let m = message(&fx.journal);
        assert_eq!(store.page(&m, &[1], None).unwrap(), PageOutcome::NotPaged);
        releaser.join().unwrap();
    }

    #[test]
    fn test_transactional_page_write_waits_for_commit() {
        let fx = fixture(small(AddressFullPolicy::Page));
        let store = fx.paging.get_or_create("a");
        store.add_size(2_000);
        let m = message(&fx.journal);
        let mut tx = Transaction::new(fx.journal.clone());
        assert_eq!(store.page(&m, &[1], Some(&mut tx)).unwrap(), PageOutcome::Paged);
        assert_eq!(store.page_count(), 0);
        tx.commit().unwrap();
        assert_eq!(store.page_count(), 1);
        assert!(store.is_paging());
    }

    #[test]
    fn test_start_depaging_requires_paging() {
        let fx = fixture(small(AddressFullPolicy::Page));
        let store = fx.paging.get_or_create("a");
        assert!(!store.start_depaging());
    }

    struct FailingWrite;

    impl TransactionOperation for FailingWrite {
        fn before_commit(&mut self, _tx_id: u64) -> StorageResult<()> {
            Err(StorageError::IoError(std::io::Error::other("disk gone")))
        }
    }

    /// A full store holding one plain and one transactional record whose
    /// commit failed after the page write.
    fn stalled_transaction(fx: &Fixture) -> (Arc<PagingStore>, Arc<Queue>, Transaction) {
        let store = fx.paging.get_or_create("a");
        let persistence = Arc::new(MessagePersistence::new(fx.journal.clone()));
        let queue = Arc::new(Queue::new(1, "q1", "a", false, persistence, store.clone()));
        fx.registry.insert(queue.clone()).unwrap();
        store.add_size(2_000);

        let plain = message(&fx.journal);
        assert_eq!(store.page(&plain, &[1], None).unwrap(), PageOutcome::Paged);
        let mut tx = Transaction::new(fx.journal.clone());
        let sent = message(&fx.journal);
        assert_eq!(store.page(&sent, &[1], Some(&mut tx)).unwrap(), PageOutcome::Paged);
        tx.add_operation(Box::new(FailingWrite));
        assert!(tx.commit().is_err());
        (store, queue, tx)
    }

    #[test]
    fn test_open_transaction_holds_page_until_rollback() {
        let fx = fixture(small(AddressFullPolicy::Page));
        let (store, queue, mut tx) = stalled_transaction(&fx);

        store.add_size(-2_000);
        assert_eq!(queue.message_count(), 0);
        assert!(store.is_paging());

        tx.rollback().unwrap();
        assert_eq!(queue.message_count(), 1);
        assert!(!store.is_paging());
        assert!(!fx
            .journal
            .records()
            .iter()
            .any(|r| r.kind == RecordKind::PageTransaction));
    }

    #[test]
    fn test_page_transaction_record_removed_with_page() {
        let fx = fixture(small(AddressFullPolicy::Page));
        let store = fx.paging.get_or_create("a");
        let persistence = Arc::new(MessagePersistence::new(fx.journal.clone()));
        let queue = Arc::new(Queue::new(1, "q1", "a", false, persistence, store.clone()));
        fx.registry.insert(queue.clone()).unwrap();
        store.add_size(2_000);

        let mut tx = Transaction::new(fx.journal.clone());
        let m = message(&fx.journal);
        store.page(&m, &[1], Some(&mut tx)).unwrap();
        tx.commit().unwrap();
        assert_eq!(
            fx.journal
                .records()
                .iter()
                .filter(|r| r.kind == RecordKind::PageTransaction)
                .count(),
            1
        );

        store.add_size(-2_000);
        let consumer = queue.add_consumer();
        let r = queue.poll(consumer).unwrap().unwrap();
        assert_eq!(r.message_id(), m.message_id);
        queue.acknowledge(r.message_id()).unwrap();
        assert!(!store.is_paging());
        assert!(fx.journal.records().is_empty());
    }
}
