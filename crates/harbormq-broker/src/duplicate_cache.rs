//! Duplicate-ID cache.
//!
//! Each address remembers the last `capacity` duplicate IDs it accepted in a
//! ring. Lookups go through a concurrent map and never take the ring lock.
//! IDs added inside a transaction stay invisible to [`DuplicateIdCache::contains`]
//! until the transaction prepares or commits, so a crash before commit never
//! leaves an ID behind that would reject the client's resend. A record made
//! visible by prepare is only deleted after its transaction commits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use harbormq_storage::{Journal, JournalRecord, RecordKind, Transaction, TransactionOperation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DuplicateCacheSettings;
use crate::error::Result;
use crate::executor::Executor;

/// Journal payload of a remembered duplicate ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateIdEntry {
    /// Address whose cache holds the ID.
    pub address: String,
    /// The client-supplied identifier.
    pub duplicate_id: Vec<u8>,
}

#[derive(Debug)]
struct Slot {
    duplicate_id: Vec<u8>,
    record_id: Option<u64>,
}

/// An ID claimed by a transaction that has not prepared or committed yet.
#[derive(Debug, Clone, Copy)]
struct PendingClaim {
    tx_id: u64,
    record_id: Option<u64>,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Slot>>,
    pos: usize,
}

/// Ring of recently accepted duplicate IDs for one address.
pub struct DuplicateIdCache {
    address: String,
    capacity: usize,
    persist: bool,
    journal: Arc<dyn Journal>,
    executor: Arc<dyn Executor>,
    lookup: DashMap<Vec<u8>, Option<u64>>,
    ring: Mutex<Ring>,
    pending: Mutex<HashMap<Vec<u8>, PendingClaim>>,
    /// Records visible through prepare whose transaction has not committed,
    /// mapped to whether their slot was evicted meanwhile.
    uncommitted: Mutex<HashMap<u64, bool>>,
}

impl std::fmt::Debug for DuplicateIdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateIdCache")
            .field("address", &self.address)
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish()
    }
}

impl DuplicateIdCache {
    /// Creates an empty cache; `capacity` must be positive.
    pub fn new(
        address: impl Into<String>,
        capacity: usize,
        persist: bool,
        journal: Arc<dyn Journal>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            address: address.into(),
            capacity,
            persist,
            journal,
            executor,
            lookup: DashMap::new(),
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                pos: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            uncommitted: Mutex::new(HashMap::new()),
        }
    }

    /// Address of this cache.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Maximum number of remembered IDs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of remembered IDs.
    pub fn size(&self) -> usize {
        self.lookup.len()
    }

    /// True if `duplicate_id` was accepted and is still remembered.
    pub fn contains(&self, duplicate_id: &[u8]) -> bool {
        self.lookup.contains_key(duplicate_id)
    }

    /// Remembers `duplicate_id`. Outside a transaction it is visible
    /// immediately; inside one it becomes visible after prepare or commit.
    pub fn add_to_cache(
        self: &Arc<Self>,
        duplicate_id: &[u8],
        tx: Option<&mut Transaction>,
    ) -> Result<()> {
        let mut ring = self.ring.lock();
        self.add_locked(&mut ring, duplicate_id, tx)
    }

    /// Checks and claims `duplicate_id` as one step. Returns false, changing
    /// nothing, when the ID is remembered or claimed by an open transaction.
    pub fn atomic_verify(
        self: &Arc<Self>,
        duplicate_id: &[u8],
        tx: Option<&mut Transaction>,
    ) -> Result<bool> {
        let mut ring = self.ring.lock();
        if self.contains(duplicate_id) || self.pending.lock().contains_key(duplicate_id) {
            debug!(address = %self.address, "duplicate id rejected");
            return Ok(false);
        }
        self.add_locked(&mut ring, duplicate_id, tx)?;
        Ok(true)
    }

    fn add_locked(
        self: &Arc<Self>,
        ring: &mut Ring,
        duplicate_id: &[u8],
        tx: Option<&mut Transaction>,
    ) -> Result<()> {
        let record_id = if self.persist {
            let record_id = self.journal.generate_unique_id();
            let entry = DuplicateIdEntry {
                address: self.address.clone(),
                duplicate_id: duplicate_id.to_vec(),
            };
            let record = JournalRecord::encode(record_id, RecordKind::DuplicateId, &entry)?;
            match &tx {
                Some(tx) => self.journal.store_transactional(tx.id(), record)?,
                None => self.journal.store(record)?,
            }
            Some(record_id)
        } else {
            None
        };

        match tx {
            Some(tx) => {
                self.pending.lock().insert(
                    duplicate_id.to_vec(),
                    PendingClaim {
                        tx_id: tx.id(),
                        record_id,
                    },
                );
                if self.persist {
                    tx.set_contains_persistent();
                }
                tx.add_operation(Box::new(AddIdOperation {
                    cache: Arc::clone(self),
                    duplicate_id: duplicate_id.to_vec(),
                    record_id,
                    prepared: false,
                    done: false,
                }));
            }
            None => self.insert(ring, duplicate_id.to_vec(), record_id),
        }
        Ok(())
    }

    fn insert(&self, ring: &mut Ring, duplicate_id: Vec<u8>, record_id: Option<u64>) {
        if let Some(mut previous) = self.lookup.get_mut(&duplicate_id) {
            // re-added: keep the slot, swap the durable record
            let old = std::mem::replace(&mut *previous, record_id);
            drop(previous);
            if let Some(slot) = ring
                .slots
                .iter_mut()
                .flatten()
                .find(|s| s.duplicate_id == duplicate_id)
            {
                slot.record_id = record_id;
            }
            self.delete_later(old);
            return;
        }

        let pos = ring.pos;
        if let Some(evicted) = ring.slots[pos].take() {
            self.lookup.remove(&evicted.duplicate_id);
            debug!(address = %self.address, pos, "duplicate id evicted");
            self.delete_later(evicted.record_id);
        }
        self.lookup.insert(duplicate_id.clone(), record_id);
        ring.slots[pos] = Some(Slot {
            duplicate_id,
            record_id,
        });
        ring.pos = (pos + 1) % self.capacity;
    }

    /// Gives back a claim taken by [`DuplicateIdCache::atomic_verify`] for a
    /// message that ended up routed nowhere. Inside a transaction the claim's
    /// record is deleted under the same transaction.
    pub fn release(&self, duplicate_id: &[u8], tx: Option<&mut Transaction>) -> Result<()> {
        match tx {
            Some(tx) => {
                let claim = {
                    let mut pending = self.pending.lock();
                    match pending.get(duplicate_id) {
                        Some(claim) if claim.tx_id == tx.id() => pending.remove(duplicate_id),
                        _ => None,
                    }
                };
                if let Some(PendingClaim {
                    record_id: Some(record_id),
                    ..
                }) = claim
                {
                    self.journal.delete_transactional(tx.id(), record_id)?;
                }
            }
            None => {
                let record_id = {
                    let mut ring = self.ring.lock();
                    let Some((_, record_id)) = self.lookup.remove(duplicate_id) else {
                        return Ok(());
                    };
                    let slot = ring
                        .slots
                        .iter()
                        .position(|s| s.as_ref().is_some_and(|s| s.duplicate_id == duplicate_id));
                    if let Some(idx) = slot {
                        ring.slots[idx] = None;
                        let last = (ring.pos + self.capacity - 1) % self.capacity;
                        if idx == last {
                            ring.pos = last;
                        }
                    }
                    record_id
                };
                if let Some(record_id) = record_id {
                    self.journal.delete(record_id)?;
                }
            }
        }
        debug!(address = %self.address, "duplicate id claim released");
        Ok(())
    }

    fn delete_later(&self, record_id: Option<u64>) {
        let Some(record_id) = record_id else {
            return;
        };
        if let Some(evicted) = self.uncommitted.lock().get_mut(&record_id) {
            // deleted once its transaction commits
            *evicted = true;
            return;
        }
        let journal = Arc::clone(&self.journal);
        let address = self.address.clone();
        self.executor.execute(Box::new(move || {
            if let Err(e) = journal.delete(record_id) {
                warn!(address = %address, record_id, error = %e, "failed to delete duplicate id record");
            }
        }));
    }

    /// Moves a transaction's claim into the ring; false if the claim was
    /// released or taken over meanwhile.
    fn apply_pending(
        &self,
        tx_id: u64,
        duplicate_id: &[u8],
        record_id: Option<u64>,
        prepared: bool,
    ) -> bool {
        let mut ring = self.ring.lock();
        {
            let mut pending = self.pending.lock();
            match pending.get(duplicate_id) {
                Some(claim) if claim.tx_id == tx_id => {
                    pending.remove(duplicate_id);
                }
                _ => return false,
            }
        }
        if prepared {
            if let Some(record_id) = record_id {
                self.uncommitted.lock().insert(record_id, false);
            }
        }
        self.insert(&mut ring, duplicate_id.to_vec(), record_id);
        true
    }

    /// The transaction of a prepared record committed: the record is live,
    /// and is deleted now if its slot was evicted while it was pending.
    fn record_committed(&self, record_id: u64) {
        if self.uncommitted.lock().remove(&record_id) == Some(true) {
            self.delete_later(Some(record_id));
        }
    }

    /// The transaction of a prepared record rolled back: the record is gone,
    /// the ID stays remembered without one.
    fn record_discarded(&self, duplicate_id: &[u8], record_id: u64) {
        let mut ring = self.ring.lock();
        self.uncommitted.lock().remove(&record_id);
        if let Some(mut current) = self.lookup.get_mut(duplicate_id) {
            if *current == Some(record_id) {
                *current = None;
            }
        }
        if let Some(slot) = ring
            .slots
            .iter_mut()
            .flatten()
            .find(|s| s.record_id == Some(record_id))
        {
            slot.record_id = None;
        }
    }

    /// Restores IDs from `(record_id, duplicate_id)` pairs ordered oldest
    /// first. When more than `capacity` were journaled the oldest are deleted.
    pub fn load(&self, entries: Vec<(u64, Vec<u8>)>) -> Result<()> {
        let excess = entries.len().saturating_sub(self.capacity);
        let mut ring = self.ring.lock();
        for (i, (record_id, duplicate_id)) in entries.into_iter().enumerate() {
            if i < excess {
                self.journal.delete(record_id)?;
                continue;
            }
            self.insert(&mut ring, duplicate_id, Some(record_id));
        }
        info!(address = %self.address, loaded = self.lookup.len(), deleted = excess, "duplicate id cache loaded");
        Ok(())
    }

    /// Forgets every ID and deletes their records.
    pub fn clear(&self) -> Result<()> {
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                if let Some(record_id) = slot.record_id {
                    self.journal.delete(record_id)?;
                }
            }
        }
        ring.pos = 0;
        self.lookup.clear();
        Ok(())
    }
}

struct AddIdOperation {
    cache: Arc<DuplicateIdCache>,
    duplicate_id: Vec<u8>,
    record_id: Option<u64>,
    prepared: bool,
    done: bool,
}

impl TransactionOperation for AddIdOperation {
    fn after_prepare(&mut self, tx_id: u64) {
        if !self.done {
            self.done = true;
            self.prepared = self
                .cache
                .apply_pending(tx_id, &self.duplicate_id, self.record_id, true);
        }
    }

    fn after_commit(&mut self, tx_id: u64) {
        if !self.done {
            self.done = true;
            self.cache
                .apply_pending(tx_id, &self.duplicate_id, self.record_id, false);
        } else if self.prepared {
            if let Some(record_id) = self.record_id {
                self.cache.record_committed(record_id);
            }
        }
    }

    fn after_rollback(&mut self, tx_id: u64) {
        if self.prepared {
            if let Some(record_id) = self.record_id {
                self.cache.record_discarded(&self.duplicate_id, record_id);
            }
            return;
        }
        if self.done {
            return;
        }
        let mut pending = self.cache.pending.lock();
        if pending.get(&self.duplicate_id).is_some_and(|c| c.tx_id == tx_id) {
            pending.remove(&self.duplicate_id);
            debug!(address = %self.cache.address, tx_id, "duplicate id released by rollback");
        }
    }
}

/// Duplicate-ID caches of every address.
pub struct DuplicateIdCaches {
    settings: DuplicateCacheSettings,
    journal: Arc<dyn Journal>,
    executor: Arc<dyn Executor>,
    caches: DashMap<String, Arc<DuplicateIdCache>>,
}

impl std::fmt::Debug for DuplicateIdCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateIdCaches")
            .field("settings", &self.settings)
            .field("addresses", &self.caches.len())
            .finish()
    }
}

impl DuplicateIdCaches {
    /// Creates the registry.
    pub fn new(
        settings: DuplicateCacheSettings,
        journal: Arc<dyn Journal>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            settings,
            journal,
            executor,
            caches: DashMap::new(),
        }
    }

    /// The cache of `address`; `None` when detection is disabled.
    pub fn get_or_create(&self, address: &str) -> Option<Arc<DuplicateIdCache>> {
        if self.settings.capacity == 0 {
            return None;
        }
        let cache = self.caches.entry(address.to_string()).or_insert_with(|| {
            Arc::new(DuplicateIdCache::new(
                address,
                self.settings.capacity,
                self.settings.persist,
                Arc::clone(&self.journal),
                Arc::clone(&self.executor),
            ))
        });
        Some(Arc::clone(cache.value()))
    }

    /// Restores every address cache from journal records.
    pub fn load(&self, records: &[JournalRecord]) -> Result<usize> {
        let mut by_address: BTreeMap<String, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
        for record in records.iter().filter(|r| r.kind == RecordKind::DuplicateId) {
            let entry: DuplicateIdEntry = record.decode()?;
            by_address
                .entry(entry.address)
                .or_default()
                .push((record.id, entry.duplicate_id));
        }

        let mut loaded = 0;
        for (address, mut entries) in by_address {
            entries.sort_by_key(|(id, _)| *id);
            match self.get_or_create(&address) {
                Some(cache) => {
                    cache.load(entries)?;
                    loaded += cache.size();
                }
                None => {
                    for (record_id, _) in entries {
                        self.journal.delete(record_id)?;
                    }
                }
            }
        }
        Ok(loaded)
    }
}
