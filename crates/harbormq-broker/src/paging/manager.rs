//! Paging manager: one paging store per address plus the global budget.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use harbormq_storage::{
    Journal, JournalRecord, PageDirectory, RecordKind, ReplicationMirror,
};
use tracing::{debug, info, warn};

use crate::config::AddressSettings;
use crate::error::Result;
use crate::executor::Executor;
use crate::paging::cursor::{
    CursorAckEntry, PageCompletedEntry, PageCursor, PageTransactionEntry,
};
use crate::paging::store::PagingStore;
use crate::queue::QueueRegistry;

/// Memory estimate summed over every address.
#[derive(Debug)]
pub struct GlobalSize {
    size: AtomicI64,
    max: i64,
}

impl GlobalSize {
    /// A budget of `max` bytes; zero or negative is unlimited.
    pub fn new(max: i64) -> Self {
        Self {
            size: AtomicI64::new(0),
            max,
        }
    }

    /// Adjusts the estimate.
    pub fn add(&self, delta: i64) -> i64 {
        self.size.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Current estimate.
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    /// True when the budget is set and exhausted.
    pub fn is_full(&self) -> bool {
        self.max > 0 && self.size() >= self.max
    }
}

/// Paging manager settings.
#[derive(Debug, Clone)]
pub struct PagingManagerConfig {
    /// Directory holding one subdirectory per paged address.
    pub root: PathBuf,
    /// Budget across all addresses; -1 for unlimited.
    pub global_max_size: i64,
    /// Settings of addresses without an override.
    pub default_settings: AddressSettings,
    /// Per-address settings.
    pub overrides: HashMap<String, AddressSettings>,
}

/// Owns the paging stores.
pub struct PagingManager {
    config: PagingManagerConfig,
    journal: Arc<dyn Journal>,
    executor: Arc<dyn Executor>,
    queues: Weak<QueueRegistry>,
    global: Arc<GlobalSize>,
    stores: DashMap<String, Arc<PagingStore>>,
    mirror: parking_lot::RwLock<Option<Arc<dyn ReplicationMirror>>>,
}

impl std::fmt::Debug for PagingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingManager")
            .field("root", &self.config.root)
            .field("stores", &self.stores.len())
            .field("global_size", &self.global.size())
            .finish()
    }
}

impl PagingManager {
    /// Creates the manager; nothing touches disk until an address pages.
    pub fn new(
        config: PagingManagerConfig,
        journal: Arc<dyn Journal>,
        executor: Arc<dyn Executor>,
        queues: &Arc<QueueRegistry>,
    ) -> Self {
        Self {
            global: Arc::new(GlobalSize::new(config.global_max_size)),
            config,
            journal,
            executor,
            queues: Arc::downgrade(queues),
            stores: DashMap::new(),
            mirror: parking_lot::RwLock::new(None),
        }
    }

    /// Paging root directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Settings in effect for `address`.
    pub fn settings_for(&self, address: &str) -> AddressSettings {
        self.config
            .overrides
            .get(address)
            .cloned()
            .unwrap_or_else(|| self.config.default_settings.clone())
    }

    /// The store of `address`, created on first use.
    pub fn get_or_create(&self, address: &str) -> Arc<PagingStore> {
        if let Some(store) = self.stores.get(address) {
            return Arc::clone(store.value());
        }
        let store = self
            .stores
            .entry(address.to_string())
            .or_insert_with(|| {
                debug!(address, "paging store created");
                let store = PagingStore::new(
                    address.to_string(),
                    self.settings_for(address),
                    self.config.root.clone(),
                    Arc::new(PageCursor::new(address, Arc::clone(&self.journal))),
                    Arc::clone(&self.global),
                    self.queues.clone(),
                    Arc::clone(&self.executor),
                );
                store.set_mirror(self.mirror.read().clone());
                Arc::new(store)
            });
        Arc::clone(store.value())
    }

    /// The store of `address`, if one exists.
    pub fn store(&self, address: &str) -> Option<Arc<PagingStore>> {
        self.stores.get(address).map(|s| Arc::clone(s.value()))
    }

    /// Every store, ordered by address.
    pub fn stores(&self) -> Vec<Arc<PagingStore>> {
        let mut stores: Vec<_> = self.stores.iter().map(|s| Arc::clone(s.value())).collect();
        stores.sort_by(|a, b| a.address().cmp(b.address()));
        stores
    }

    /// Global memory estimate.
    pub fn global_size(&self) -> i64 {
        self.global.size()
    }

    /// True when the global budget is exhausted.
    pub fn is_global_full(&self) -> bool {
        self.global.is_full()
    }

    /// Mirrors page writes of every current and future store.
    pub fn set_mirror(&self, mirror: Option<Arc<dyn ReplicationMirror>>) {
        *self.mirror.write() = mirror.clone();
        for store in self.stores() {
            store.set_mirror(mirror.clone());
        }
    }

    /// Kicks depaging on every paging store with room; returns how many
    /// tasks were started.
    pub fn start_depaging(&self) -> usize {
        self.stores()
            .iter()
            .filter(|s| !s.is_full() && s.start_depaging())
            .count()
    }

    /// Rebuilds paging state after a restart.
    ///
    /// Cursor bookmarks are loaded before any page is considered, completed
    /// pages are finished off, and bookmarks of addresses whose directory
    /// disappeared are deleted.
    pub fn reload(&self, records: &[JournalRecord]) -> Result<()> {
        std::fs::create_dir_all(&self.config.root)?;
        let directories = PageDirectory::scan(&self.config.root)?;
        let mut known = HashSet::new();
        for mut directory in directories {
            directory.set_mirror(self.mirror.read().clone());
            let address = directory.address().to_string();
            if !known.insert(address.clone()) {
                warn!(address = %address, dir = %directory.path().display(), "ignoring second page directory for address");
                continue;
            }
            let store = self.get_or_create(&address);
            store.cursor().load(records)?;
            store.cursor().attach_directory(directory.clone());
            store.cursor().finish_completed()?;
            store.reload(directory)?;
        }

        let mut orphans = 0;
        for record in records {
            let address = match record.kind {
                RecordKind::PageCursorAck => record.decode::<CursorAckEntry>()?.address,
                RecordKind::PageCompleted => record.decode::<PageCompletedEntry>()?.address,
                RecordKind::PageTransaction => record.decode::<PageTransactionEntry>()?.address,
                _ => continue,
            };
            if !known.contains(&address) {
                self.journal.delete(record.id)?;
                orphans += 1;
            }
        }
        info!(
            addresses = known.len(),
            orphan_bookmarks = orphans,
            "paging reloaded"
        );
        Ok(())
    }
}
