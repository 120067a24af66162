//! The post office: address table and the send path.
//!
//! A send runs the duplicate check, then route, then the paging decision,
//! then delivery. A duplicate never reaches the bindings, so round-robin
//! positions and group bindings stay untouched. A message that then matches
//! no binding gives its duplicate ID back. Inside a transaction the journal
//! writes are transactional and the references reach the queues only after
//! commit.

use std::sync::Arc;

use dashmap::DashMap;
use harbormq_storage::{Journal, JournalRecord, RecordKind, Transaction, TransactionOperation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DuplicateCacheSettings, QueueConfig};
use crate::duplicate_cache::DuplicateIdCaches;
use crate::error::{BrokerError, Result};
use crate::executor::Executor;
use crate::grouping::GroupingHandler;
use crate::message::{Message, MessageReference};
use crate::notifications::{Notification, NotificationService};
use crate::paging::{PageOutcome, PagingManager, PagingManagerConfig};
use crate::persistence::MessagePersistence;
use crate::queue::{Queue, QueueRegistry};
use crate::routing::{Binding, Bindings, Filter, RoutingContext};

/// Result of [`PostOffice::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStatus {
    /// Delivered, paged, or scheduled for delivery at commit.
    Ok,
    /// No binding accepted the message.
    NoBindings,
    /// The duplicate ID was already accepted.
    Duplicate,
    /// The address is full and drops messages.
    Dropped,
}

/// Journal payload of a durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueBindingEntry {
    /// The queue definition.
    pub config: QueueConfig,
}

/// Address table plus everything the send path touches.
pub struct PostOffice {
    journal: Arc<dyn Journal>,
    addresses: DashMap<String, Arc<Bindings>>,
    queues: Arc<QueueRegistry>,
    persistence: Arc<MessagePersistence>,
    duplicate_caches: DuplicateIdCaches,
    paging: PagingManager,
    grouping: RwLock<Option<Arc<dyn GroupingHandler>>>,
    notifications: Arc<NotificationService>,
    route_when_no_consumers: bool,
}

impl std::fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOffice")
            .field("addresses", &self.addresses.len())
            .field("queues", &self.queues.len())
            .field("paging", &self.paging)
            .finish()
    }
}

impl PostOffice {
    /// Creates an empty post office.
    pub fn new(
        journal: Arc<dyn Journal>,
        executor: Arc<dyn Executor>,
        paging: PagingManagerConfig,
        duplicate_cache: DuplicateCacheSettings,
        notifications: Arc<NotificationService>,
        route_when_no_consumers: bool,
    ) -> Self {
        let queues = Arc::new(QueueRegistry::new());
        Self {
            persistence: Arc::new(MessagePersistence::new(Arc::clone(&journal))),
            duplicate_caches: DuplicateIdCaches::new(
                duplicate_cache,
                Arc::clone(&journal),
                Arc::clone(&executor),
            ),
            paging: PagingManager::new(paging, Arc::clone(&journal), executor, &queues),
            journal,
            addresses: DashMap::new(),
            queues,
            grouping: RwLock::new(None),
            notifications,
            route_when_no_consumers,
        }
    }

    /// The queue registry.
    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// The paging manager.
    pub fn paging(&self) -> &PagingManager {
        &self.paging
    }

    /// Duplicate-ID caches.
    pub fn duplicate_caches(&self) -> &DuplicateIdCaches {
        &self.duplicate_caches
    }

    /// The notification bus.
    pub fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    /// Installs the grouping handler on every current and future address.
    pub fn set_grouping_handler(&self, handler: Option<Arc<dyn GroupingHandler>>) {
        *self.grouping.write() = handler.clone();
        for bindings in self.addresses.iter() {
            bindings.set_grouping_handler(handler.clone());
        }
    }

    /// The binding table of `address`, if anything was ever bound to it.
    pub fn bindings(&self, address: &str) -> Option<Arc<Bindings>> {
        self.addresses.get(address).map(|b| Arc::clone(b.value()))
    }

    fn bindings_for(&self, address: &str) -> Arc<Bindings> {
        let bindings = self.addresses.entry(address.to_string()).or_insert_with(|| {
            let bindings = Bindings::new(address);
            bindings.set_route_when_no_consumers(self.route_when_no_consumers);
            bindings.set_grouping_handler(self.grouping.read().clone());
            Arc::new(bindings)
        });
        Arc::clone(bindings.value())
    }

    /// Creates a queue and binds it to its address. Durable queues are
    /// journaled and come back on recovery with the same ID.
    pub fn create_queue(&self, config: QueueConfig) -> Result<Arc<Queue>> {
        if self.queues.get_by_name(&config.name).is_some() {
            return Err(BrokerError::QueueExists { name: config.name });
        }
        let id = self.journal.generate_unique_id();
        let durable = config.durable;
        if durable {
            let entry = QueueBindingEntry {
                config: config.clone(),
            };
            self.journal
                .store(JournalRecord::encode(id, RecordKind::QueueBinding, &entry)?)?;
        }
        match self.install_queue(id, config) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                if durable {
                    self.journal.delete(id)?;
                }
                Err(e)
            }
        }
    }

    fn install_queue(&self, id: u64, config: QueueConfig) -> Result<Arc<Queue>> {
        let filter = config.filter.as_deref().map(Filter::parse).transpose()?;
        let queue = Arc::new(Queue::new(
            id,
            config.name.clone(),
            config.address.clone(),
            config.durable,
            Arc::clone(&self.persistence),
            self.paging.get_or_create(&config.address),
        ));
        self.queues.insert(Arc::clone(&queue))?;

        let routing_name = config
            .routing_name
            .clone()
            .unwrap_or_else(|| config.address.clone());
        let mut binding = Binding::new(id, config.address.clone(), routing_name, queue.clone());
        if let Some(filter) = filter {
            binding = binding.with_filter(filter);
        }
        if config.exclusive {
            binding = binding.exclusive();
        }
        if let Err(e) = self.add_binding(Arc::new(binding)) {
            self.queues.remove(&config.name);
            return Err(e);
        }
        info!(queue = %config.name, address = %config.address, queue_id = id, durable = config.durable, "queue created");
        Ok(queue)
    }

    /// Adds a binding and announces it.
    pub fn add_binding(&self, binding: Arc<Binding>) -> Result<()> {
        let notification = Notification::BindingAdded {
            address: binding.address.clone(),
            cluster_name: binding.cluster_name.clone(),
            binding_id: binding.id,
            distance: binding.distance,
        };
        self.bindings_for(&binding.address).add_binding(binding)?;
        self.notifications.send(notification);
        Ok(())
    }

    /// Removes a binding and announces it; grouping evicts groups pinned to it.
    pub fn remove_binding(&self, address: &str, binding_id: u64) -> Result<Arc<Binding>> {
        let bindings = self
            .bindings(address)
            .ok_or(BrokerError::BindingNotFound { binding_id })?;
        let binding = bindings.remove_binding(binding_id)?;
        self.notifications.send(Notification::BindingRemoved {
            address: address.to_string(),
            cluster_name: binding.cluster_name.clone(),
            binding_id,
        });
        Ok(binding)
    }

    /// Unbinds and deletes a queue, releasing everything it held.
    pub fn destroy_queue(&self, name: &str) -> Result<()> {
        let queue = self
            .queues
            .get_by_name(name)
            .ok_or_else(|| BrokerError::QueueNotFound {
                name: name.to_string(),
            })?;
        self.remove_binding(queue.address(), queue.id())?;
        self.queues.remove(name);
        let released = queue.drain()?;
        if queue.is_durable() {
            self.journal.delete(queue.id())?;
        }
        info!(queue = %name, released, "queue destroyed");
        Ok(())
    }

    /// Sends `message` to its address.
    pub fn route(&self, mut message: Message, mut tx: Option<&mut Transaction>) -> Result<RoutingStatus> {
        let Some(bindings) = self.bindings(&message.address) else {
            debug!(address = %message.address, "no bindings for address");
            return Ok(RoutingStatus::NoBindings);
        };

        let mut claim = None;
        if let Some(duplicate_id) = message.duplicate_id() {
            if let Some(cache) = self.duplicate_caches.get_or_create(&message.address) {
                if !cache.atomic_verify(&duplicate_id, tx.as_deref_mut())? {
                    return Ok(RoutingStatus::Duplicate);
                }
                claim = Some((cache, duplicate_id));
            }
        }

        let mut ctx = RoutingContext::new(tx.as_ref().map(|tx| tx.id()));
        let routed = match bindings.route(&mut message, &mut ctx) {
            Ok(routed) => routed && !ctx.is_empty(),
            Err(e) => {
                if let Some((cache, duplicate_id)) = claim {
                    cache.release(&duplicate_id, tx.as_deref_mut())?;
                }
                return Err(e);
            }
        };
        if !routed {
            if let Some((cache, duplicate_id)) = claim {
                cache.release(&duplicate_id, tx.as_deref_mut())?;
            }
            debug!(address = %message.address, "message matched no binding");
            return Ok(RoutingStatus::NoBindings);
        }

        if message.message_id == 0 {
            message.message_id = self.journal.generate_unique_id();
        }
        let queue_ids = ctx.queue_ids().to_vec();
        let store = self.paging.get_or_create(&message.address);
        match store.page(&message, &queue_ids, tx.as_deref_mut())? {
            PageOutcome::Paged => {
                debug!(address = %message.address, message_id = message.message_id, "message paged");
                Ok(RoutingStatus::Ok)
            }
            PageOutcome::Dropped => Ok(RoutingStatus::Dropped),
            PageOutcome::NotPaged => {
                self.deliver(message, &queue_ids, tx)?;
                Ok(RoutingStatus::Ok)
            }
        }
    }

    fn deliver(&self, message: Message, queue_ids: &[u64], mut tx: Option<&mut Transaction>) -> Result<()> {
        let queues: Vec<Arc<Queue>> = queue_ids
            .iter()
            .filter_map(|id| self.queues.get(*id))
            .collect();
        let durable_ids: Vec<u64> = queues
            .iter()
            .filter(|q| q.is_durable())
            .map(|q| q.id())
            .collect();
        if message.durable && !durable_ids.is_empty() {
            self.persistence
                .store_message(&message, &durable_ids, tx.as_deref_mut())?;
        }

        let message = Arc::new(message);
        match tx {
            Some(tx) => tx.add_operation(Box::new(DeliverOperation { message, queues })),
            None => {
                for queue in queues {
                    queue.add_reference(MessageReference::new(Arc::clone(&message), queue.id()));
                }
            }
        }
        Ok(())
    }

    /// Moves a waiting message from a queue without consumers to a sibling
    /// binding that has some. Returns false, leaving the message where it
    /// was, when no sibling qualifies.
    pub fn redistribute(&self, queue_name: &str, message_id: u64) -> Result<bool> {
        let queue = self
            .queues
            .get_by_name(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound {
                name: queue_name.to_string(),
            })?;
        let Some(bindings) = self.bindings(queue.address()) else {
            return Ok(false);
        };
        let Some(mut message) = queue.take(message_id)? else {
            return Err(BrokerError::ReferenceNotFound {
                queue: queue_name.to_string(),
                message_id,
            });
        };

        let mut ctx = RoutingContext::new(None);
        let moved = bindings.redistribute(&mut message, queue.id(), &mut ctx)?;
        if !moved {
            ctx.add_queue(queue.id());
        }
        self.deliver(message, ctx.queue_ids(), None)?;
        Ok(moved)
    }

    /// Acknowledges a delivered message and lets paged addresses refill.
    pub fn acknowledge(&self, queue_name: &str, message_id: u64) -> Result<()> {
        let queue = self
            .queues
            .get_by_name(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound {
                name: queue_name.to_string(),
            })?;
        queue.acknowledge(message_id)?;
        self.paging.start_depaging();
        Ok(())
    }

    /// Expires waiting messages in every queue, routing copies to each
    /// address's expiry address. Returns how many copies were sent.
    pub fn expire(&self, now: u64) -> Result<usize> {
        let mut sent = 0;
        for queue in self.queues.all() {
            let settings = self.paging.settings_for(queue.address());
            let copies = queue.expire_references(now, settings.expiry_address.as_deref())?;
            for copy in copies {
                let address = copy.address.clone();
                match self.route(copy, None)? {
                    RoutingStatus::Ok => sent += 1,
                    status => warn!(queue = %queue.name(), expiry_address = %address, ?status, "expired message not delivered"),
                }
            }
        }
        Ok(sent)
    }

    /// Rebuilds state from the journal: durable queues, duplicate IDs,
    /// messages, then paging.
    pub fn recover(&self, records: &[JournalRecord]) -> Result<()> {
        let mut queues = 0;
        for record in records.iter().filter(|r| r.kind == RecordKind::QueueBinding) {
            let entry: QueueBindingEntry = record.decode()?;
            self.install_queue(record.id, entry.config)?;
            queues += 1;
        }

        let duplicate_ids = self.duplicate_caches.load(records)?;

        let mut messages = 0;
        for recovered in self.persistence.recover(records)? {
            let live: Vec<Arc<Queue>> = recovered
                .queue_ids
                .iter()
                .filter_map(|id| self.queues.get(*id))
                .collect();
            let message = Arc::new(recovered.message);
            if live.is_empty() {
                warn!(message_id = message.message_id, "recovered message has no queue, deleting");
                let last = recovered.queue_ids.first().copied().unwrap_or_default();
                self.persistence.acknowledge(message.message_id, last, 0)?;
                continue;
            }
            for queue in live {
                queue.add_reference(MessageReference::new(Arc::clone(&message), queue.id()));
            }
            messages += 1;
        }

        self.paging.reload(records)?;
        let depaging = self.paging.start_depaging();
        info!(queues, duplicate_ids, messages, depaging, "post office recovered");
        Ok(())
    }
}

struct DeliverOperation {
    message: Arc<Message>,
    queues: Vec<Arc<Queue>>,
}

impl TransactionOperation for DeliverOperation {
    fn after_commit(&mut self, tx_id: u64) {
        for queue in self.queues.drain(..) {
            queue.add_reference(MessageReference::new(Arc::clone(&self.message), queue.id()));
        }
        debug!(tx_id, message_id = self.message.message_id, "transactional delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressFullPolicy, AddressSettings};
    use crate::executor::DirectExecutor;
    use crate::grouping::LocalGroupingHandler;
    use crate::message::now_millis;
    use harbormq_storage::{InMemoryJournal, StorageError, StorageResult};
    use std::collections::HashMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        journal: Arc<InMemoryJournal>,
        notifications: Arc<NotificationService>,
        post_office: PostOffice,
    }

    fn fixture_with(settings: AddressSettings, route_when_no_consumers: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(InMemoryJournal::new());
        let notifications = Arc::new(NotificationService::new());
        let mut overrides = HashMap::new();
        overrides.insert(
            "orders".to_string(),
            AddressSettings {
                expiry_address: Some("expired".to_string()),
                ..settings.clone()
            },
        );
        let post_office = PostOffice::new(
            journal.clone(),
            Arc::new(DirectExecutor),
            PagingManagerConfig {
                root: dir.path().join("paging"),
                global_max_size: -1,
                default_settings: settings,
                overrides,
            },
            DuplicateCacheSettings::default(),
            notifications.clone(),
            route_when_no_consumers,
        );
        Fixture {
            _dir: dir,
            journal,
            notifications,
            post_office,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AddressSettings::default(), true)
    }

    fn durable(address: &str) -> Message {
        Message::new(address, "body").with_durable(true)
    }

    #[test]
    fn test_route_without_bindings() {
        let fx = fixture();
        let status = fx.post_office.route(durable("nowhere"), None).unwrap();
        assert_eq!(status, RoutingStatus::NoBindings);
        assert!(fx.journal.records().is_empty());
    }

    #[test]
    fn test_round_robin_between_queues() {
        let fx = fixture();
        let mut q1 = QueueConfig::new("r1", "orders");
        q1.routing_name = Some("q".to_string());
        let mut q2 = QueueConfig::new("r2", "orders");
        q2.routing_name = Some("q".to_string());
        let r1 = fx.post_office.create_queue(q1).unwrap();
        let r2 = fx.post_office.create_queue(q2).unwrap();

        for _ in 0..4 {
            assert_eq!(
                fx.post_office.route(durable("orders"), None).unwrap(),
                RoutingStatus::Ok
            );
        }
        assert_eq!(r1.message_count(), 2);
        assert_eq!(r2.message_count(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let fx = fixture();
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        let m = durable("orders").with_duplicate_id("order-1");
        assert_eq!(fx.post_office.route(m.clone(), None).unwrap(), RoutingStatus::Ok);
        assert_eq!(fx.post_office.route(m, None).unwrap(), RoutingStatus::Duplicate);
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn test_transactional_send_delivers_at_commit() {
        let fx = fixture();
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        let mut tx = Transaction::new(fx.journal.clone());
        let m = durable("orders").with_duplicate_id("order-1");
        fx.post_office.route(m, Some(&mut tx)).unwrap();
        assert_eq!(queue.message_count(), 0);
        let cache = fx.post_office.duplicate_caches().get_or_create("orders").unwrap();
        assert!(!cache.contains(b"order-1"));

        tx.commit().unwrap();
        assert_eq!(queue.message_count(), 1);
        assert!(cache.contains(b"order-1"));
    }

    #[test]
    fn test_transactional_rollback_allows_resend() {
        let fx = fixture();
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        let m = durable("orders").with_duplicate_id("order-1");
        let mut tx = Transaction::new(fx.journal.clone());
        fx.post_office.route(m.clone(), Some(&mut tx)).unwrap();
        tx.rollback().unwrap();
        assert_eq!(queue.message_count(), 0);

        assert_eq!(fx.post_office.route(m, None).unwrap(), RoutingStatus::Ok);
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn test_filtered_queue() {
        let fx = fixture();
        let mut eu = QueueConfig::new("eu", "orders");
        eu.filter = Some("region = 'eu'".to_string());
        eu.exclusive = true;
        let eu = fx.post_office.create_queue(eu).unwrap();
        let all = fx
            .post_office
            .create_queue(QueueConfig::new("all", "orders"))
            .unwrap();

        fx.post_office
            .route(durable("orders").with_property("region", "eu"), None)
            .unwrap();
        fx.post_office
            .route(durable("orders").with_property("region", "us"), None)
            .unwrap();
        assert_eq!(eu.message_count(), 1);
        assert_eq!(all.message_count(), 1);
    }

    #[test]
    fn test_invalid_filter_rolls_back_queue() {
        let fx = fixture();
        let mut bad = QueueConfig::new("bad", "orders");
        bad.filter = Some("region = ".to_string());
        assert!(matches!(
            fx.post_office.create_queue(bad),
            Err(BrokerError::InvalidFilter { .. })
        ));
        assert!(fx.post_office.queues().is_empty());
        assert!(fx.journal.records().is_empty());
    }

    #[test]
    fn test_recover_restores_queues_and_messages() {
        let fx = fixture();
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        fx.post_office.route(durable("orders"), None).unwrap();
        fx.post_office
            .route(durable("orders").with_duplicate_id("d1"), None)
            .unwrap();
        let consumer = queue.add_consumer();
        let first = queue.poll(consumer).unwrap().unwrap();
        fx.post_office.acknowledge("q", first.message_id()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let restarted = PostOffice::new(
            fx.journal.clone(),
            Arc::new(DirectExecutor),
            PagingManagerConfig {
                root: dir.path().join("paging"),
                global_max_size: -1,
                default_settings: AddressSettings::default(),
                overrides: HashMap::new(),
            },
            DuplicateCacheSettings::default(),
            Arc::new(NotificationService::new()),
            true,
        );
        restarted.recover(&fx.journal.records()).unwrap();
        let recovered = restarted.queues().get_by_name("q").unwrap();
        assert_eq!(recovered.id(), queue.id());
        assert_eq!(recovered.message_count(), 1);
        assert_eq!(
            restarted
                .route(durable("orders").with_duplicate_id("d1"), None)
                .unwrap(),
            RoutingStatus::Duplicate
        );
    }

    #[test]
    fn test_destroy_queue_releases_messages() {
        let fx = fixture();
        fx.post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        fx.post_office.route(durable("orders"), None).unwrap();
        fx.post_office.destroy_queue("q").unwrap();
        assert!(fx.journal.records().is_empty());
        assert_eq!(
            fx.post_office.route(durable("orders"), None).unwrap(),
            RoutingStatus::NoBindings
        );
        assert!(matches!(
            fx.post_office.destroy_queue("q"),
            Err(BrokerError::QueueNotFound { .. })
        ));
    }

    #[test]
    fn test_redistribute_to_queue_with_consumer() {
        let fx = fixture_with(AddressSettings::default(), false);
        let mut a = QueueConfig::new("a", "orders");
        a.routing_name = Some("q".to_string());
        let mut b = QueueConfig::new("b", "orders");
        b.routing_name = Some("q".to_string());
        let a = fx.post_office.create_queue(a).unwrap();
        let b = fx.post_office.create_queue(b).unwrap();

        fx.post_office.route(durable("orders"), None).unwrap();
        let (from, to) = if a.message_count() == 1 { (a, b) } else { (b, a) };
        let message_id = {
            let c = from.add_consumer();
            let r = from.poll(c).unwrap().unwrap();
            from.cancel(r.message_id()).unwrap();
            from.remove_consumer(c);
            r.message_id()
        };
        to.add_consumer();

        assert!(fx.post_office.redistribute(from.name(), message_id).unwrap());
        assert_eq!(from.message_count(), 0);
        assert_eq!(to.message_count(), 1);
        assert_eq!(fx.journal.records().iter().filter(|r| r.kind == RecordKind::Message).count(), 1);
    }

    #[test]
    fn test_expire_routes_copies() {
        let fx = fixture();
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        let dead = fx
            .post_office
            .create_queue(QueueConfig::new("expired", "expired"))
            .unwrap();
        fx.post_office
            .route(durable("orders").with_expiration(1), None)
            .unwrap();
        assert_eq!(fx.post_office.expire(now_millis()).unwrap(), 1);
        assert_eq!(queue.message_count(), 0);
        assert_eq!(dead.message_count(), 1);
    }

    #[test]
    fn test_paged_address_keeps_order() {
        let fx = fixture_with(
            AddressSettings {
                max_size_bytes: 600,
                address_full_policy: AddressFullPolicy::Page,
                ..AddressSettings::default()
            },
            true,
        );
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        let store = fx.post_office.paging().get_or_create("orders");
        let mut sent = Vec::new();
        for i in 0..10 {
            let m = durable("orders").with_property("seq", i);
            fx.post_office.route(m, None).unwrap();
            sent.push(i);
        }
        assert!(store.is_paging());

        let consumer = queue.add_consumer();
        let mut received = Vec::new();
        while let Some(r) = queue.poll(consumer).unwrap() {
            if let Some(crate::message::Value::Int(seq)) = r.message.property("seq") {
                received.push(*seq);
            }
            fx.post_office.acknowledge("q", r.message_id()).unwrap();
        }
        assert_eq!(received, sent);
        assert!(!store.is_paging());
    }

    #[test]
    fn test_grouped_messages_stick() {
        let fx = fixture();
        let handler = LocalGroupingHandler::new(
            "node-a",
            fx.journal.clone(),
            fx.notifications.clone(),
            None,
        );
        fx.post_office.set_grouping_handler(Some(handler));
        let mut a = QueueConfig::new("a", "orders");
        a.routing_name = Some("q".to_string());
        let mut b = QueueConfig::new("b", "orders");
        b.routing_name = Some("q".to_string());
        let a = fx.post_office.create_queue(a).unwrap();
        let b = fx.post_office.create_queue(b).unwrap();

        for _ in 0..4 {
            fx.post_office
                .route(durable("orders").with_group_id("G1"), None)
                .unwrap();
        }
        let counts = (a.message_count(), b.message_count());
        assert!(counts == (4, 0) || counts == (0, 4));
    }

    #[test]
    fn test_duplicate_does_not_advance_round_robin() {
        let fx = fixture();
        let mut q1 = QueueConfig::new("r1", "orders");
        q1.routing_name = Some("q".to_string());
        let mut q2 = QueueConfig::new("r2", "orders");
        q2.routing_name = Some("q".to_string());
        let r1 = fx.post_office.create_queue(q1).unwrap();
        let r2 = fx.post_office.create_queue(q2).unwrap();

        let m = durable("orders").with_duplicate_id("D");
        assert_eq!(fx.post_office.route(m.clone(), None).unwrap(), RoutingStatus::Ok);
        assert_eq!(fx.post_office.route(m, None).unwrap(), RoutingStatus::Duplicate);
        assert_eq!(
            fx.post_office.route(durable("orders"), None).unwrap(),
            RoutingStatus::Ok
        );
        assert_eq!((r1.message_count(), r2.message_count()), (1, 1));
    }

    #[test]
    fn test_unrouted_message_gives_duplicate_id_back() {
        let fx = fixture();
        let mut eu = QueueConfig::new("eu", "orders");
        eu.filter = Some("region = 'eu'".to_string());
        eu.exclusive = true;
        fx.post_office.create_queue(eu).unwrap();

        let m = durable("orders")
            .with_property("region", "us")
            .with_duplicate_id("order-1");
        assert_eq!(
            fx.post_office.route(m.clone(), None).unwrap(),
            RoutingStatus::NoBindings
        );
        let cache = fx.post_office.duplicate_caches().get_or_create("orders").unwrap();
        assert!(!cache.contains(b"order-1"));
        assert!(!fx
            .journal
            .records()
            .iter()
            .any(|r| r.kind == RecordKind::DuplicateId));

        let all = fx
            .post_office
            .create_queue(QueueConfig::new("all", "orders"))
            .unwrap();
        assert_eq!(fx.post_office.route(m, None).unwrap(), RoutingStatus::Ok);
        assert_eq!(all.message_count(), 1);
    }

    #[test]
    fn test_unrouted_transactional_message_gives_duplicate_id_back() {
        let fx = fixture();
        let mut eu = QueueConfig::new("eu", "orders");
        eu.filter = Some("region = 'eu'".to_string());
        eu.exclusive = true;
        let eu = fx.post_office.create_queue(eu).unwrap();

        let mut tx = Transaction::new(fx.journal.clone());
        let us = durable("orders")
            .with_property("region", "us")
            .with_duplicate_id("order-1");
        assert_eq!(
            fx.post_office.route(us, Some(&mut tx)).unwrap(),
            RoutingStatus::NoBindings
        );
        tx.commit().unwrap();

        let retry = durable("orders")
            .with_property("region", "eu")
            .with_duplicate_id("order-1");
        assert_eq!(fx.post_office.route(retry, None).unwrap(), RoutingStatus::Ok);
        assert_eq!(eu.message_count(), 1);
    }

    #[test]
    fn test_grouped_duplicate_keeps_group_queue() {
        let fx = fixture();
        let handler = LocalGroupingHandler::new(
            "node-a",
            fx.journal.clone(),
            fx.notifications.clone(),
            None,
        );
        fx.post_office.set_grouping_handler(Some(handler));
        let mut a = QueueConfig::new("a", "orders");
        a.routing_name = Some("q".to_string());
        let mut b = QueueConfig::new("b", "orders");
        b.routing_name = Some("q".to_string());
        let a = fx.post_office.create_queue(a).unwrap();
        let b = fx.post_office.create_queue(b).unwrap();

        let first = durable("orders").with_group_id("G1").with_duplicate_id("d1");
        assert_eq!(fx.post_office.route(first.clone(), None).unwrap(), RoutingStatus::Ok);
        assert_eq!(fx.post_office.route(first, None).unwrap(), RoutingStatus::Duplicate);
        assert_eq!(
            fx.post_office
                .route(durable("orders").with_group_id("G1"), None)
                .unwrap(),
            RoutingStatus::Ok
        );
        let counts = (a.message_count(), b.message_count());
        assert!(counts == (2, 0) || counts == (0, 2));
    }

    struct FailingWrite;

    impl TransactionOperation for FailingWrite {
        fn before_commit(&mut self, _tx_id: u64) -> StorageResult<()> {
            Err(StorageError::IoError(std::io::Error::other("disk gone")))
        }
    }

    fn paged_fixture() -> (Fixture, Arc<Queue>) {
        let fx = fixture_with(
            AddressSettings {
                max_size_bytes: 600,
                address_full_policy: AddressFullPolicy::Page,
                ..AddressSettings::default()
            },
            true,
        );
        let queue = fx
            .post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        for i in 0..10 {
            fx.post_office
                .route(durable("orders").with_property("seq", i), None)
                .unwrap();
        }
        assert!(fx.post_office.paging().get_or_create("orders").is_paging());
        (fx, queue)
    }

    fn drain_sequence(fx: &Fixture, queue: &Queue) -> Vec<i32> {
        let consumer = queue.add_consumer();
        let mut received = Vec::new();
        while let Some(r) = queue.poll(consumer).unwrap() {
            if let Some(crate::message::Value::Int(seq)) = r.message.property("seq") {
                received.push(*seq);
            }
            fx.post_office.acknowledge("q", r.message_id()).unwrap();
        }
        received
    }

    #[test]
    fn test_paged_transaction_rolled_back_after_failed_commit() {
        let (fx, queue) = paged_fixture();
        let mut tx = Transaction::new(fx.journal.clone());
        assert_eq!(
            fx.post_office
                .route(durable("orders").with_property("seq", 100), Some(&mut tx))
                .unwrap(),
            RoutingStatus::Ok
        );
        tx.add_operation(Box::new(FailingWrite));
        assert!(tx.commit().is_err());
        tx.rollback().unwrap();

        assert_eq!(drain_sequence(&fx, &queue), (0..10).collect::<Vec<i32>>());
        assert_eq!(queue.message_count(), 0);
        assert!(!fx.post_office.paging().get_or_create("orders").is_paging());
        assert!(!fx
            .journal
            .records()
            .iter()
            .any(|r| r.kind == RecordKind::PageTransaction));
    }

    #[test]
    fn test_paged_transaction_delivered_after_commit() {
        let (fx, queue) = paged_fixture();
        let mut tx = Transaction::new(fx.journal.clone());
        fx.post_office
            .route(durable("orders").with_property("seq", 100), Some(&mut tx))
            .unwrap();
        tx.commit().unwrap();

        let mut expected: Vec<i32> = (0..10).collect();
        expected.push(100);
        assert_eq!(drain_sequence(&fx, &queue), expected);
    }
}
