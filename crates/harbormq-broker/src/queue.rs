//! Local queues, the queue registry and the idle-consumer reaper.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::message::{now_millis, Message, MessageReference};
use crate::notifications::{Notification, NotificationService};
use crate::paging::PagingStore;
use crate::persistence::MessagePersistence;
use crate::routing::{Bindable, RoutingContext};

#[derive(Debug)]
struct Delivery {
    consumer_id: u64,
    reference: MessageReference,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<MessageReference>,
    delivering: HashMap<u64, Delivery>,
    consumers: HashMap<u64, u64>,
}

/// A local queue.
pub struct Queue {
    id: u64,
    name: String,
    address: String,
    durable: bool,
    persistence: Arc<MessagePersistence>,
    store: Arc<PagingStore>,
    state: Mutex<QueueState>,
    next_consumer_id: AtomicU64,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("durable", &self.durable)
            .finish()
    }
}

impl Queue {
    /// Creates an empty queue whose memory is charged to `store`.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        address: impl Into<String>,
        durable: bool,
        persistence: Arc<MessagePersistence>,
        store: Arc<PagingStore>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            durable,
            persistence,
            store,
            state: Mutex::new(QueueState::default()),
            next_consumer_id: AtomicU64::new(1),
        }
    }

    /// Queue ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the queue is bound to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the queue survives restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Messages waiting for a consumer.
    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Messages handed to consumers and not yet acknowledged.
    pub fn delivering_count(&self) -> usize {
        self.state.lock().delivering.len()
    }

    /// Appends a reference and charges its memory to the address.
    pub fn add_reference(&self, reference: MessageReference) {
        let message = &reference.message;
        message.increment_refs(message.durable && self.durable);
        self.store.add_size(message.memory_estimate());
        self.state.lock().messages.push_back(reference);
    }

    /// Registers a consumer; returns its ID.
    pub fn add_consumer(&self) -> u64 {
        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().consumers.insert(consumer_id, now_millis());
        debug!(queue = %self.name, consumer_id, "consumer added");
        consumer_id
    }

    /// Refreshes a consumer's liveness; false if unknown.
    pub fn touch_consumer(&self, consumer_id: u64) -> bool {
        match self.state.lock().consumers.get_mut(&consumer_id) {
            Some(last_seen) => {
                *last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Consumers not seen since `now - ttl`.
    pub fn idle_consumers(&self, now: u64, ttl: Duration) -> Vec<u64> {
        let ttl_ms = ttl.as_millis() as u64;
        let mut idle: Vec<u64> = self
            .state
            .lock()
            .consumers
            .iter()
            .filter(|(_, last_seen)| now.saturating_sub(**last_seen) > ttl_ms)
            .map(|(id, _)| *id)
            .collect();
        idle.sort_unstable();
        idle
    }

    /// Detaches a consumer and returns its in-flight messages to the head of
    /// the queue; returns how many were returned.
    pub fn remove_consumer(&self, consumer_id: u64) -> usize {
        let mut state = self.state.lock();
        state.consumers.remove(&consumer_id);
        let mut returned: Vec<u64> = state
            .delivering
            .iter()
            .filter(|(_, d)| d.consumer_id == consumer_id)
            .map(|(id, _)| *id)
            .collect();
        returned.sort_unstable();
        for message_id in returned.iter().rev() {
            if let Some(delivery) = state.delivering.remove(message_id) {
                state.messages.push_front(delivery.reference);
            }
        }
        returned.len()
    }

    /// Hands the next deliverable message to `consumer_id`.
    pub fn poll(&self, consumer_id: u64) -> Result<Option<MessageReference>> {
        let now = now_millis();
        let mut state = self.state.lock();
        match state.consumers.get_mut(&consumer_id) {
            Some(last_seen) => *last_seen = now,
            None => {
                return Err(BrokerError::IllegalState(format!(
                    "consumer {consumer_id} is not attached to queue {}",
                    self.name
                )))
            }
        }
        let Some(idx) = state
            .messages
            .iter()
            .position(|r| r.scheduled_delivery_time <= now)
        else {
            return Ok(None);
        };
        let Some(mut reference) = state.messages.remove(idx) else {
            return Ok(None);
        };
        reference.delivery_count += 1;
        state.delivering.insert(
            reference.message_id(),
            Delivery {
                consumer_id,
                reference: reference.clone(),
            },
        );
        Ok(Some(reference))
    }

    /// Acknowledges a delivered message.
    pub fn acknowledge(&self, message_id: u64) -> Result<()> {
        let delivery = self
            .state
            .lock()
            .delivering
            .remove(&message_id)
            .ok_or_else(|| BrokerError::ReferenceNotFound {
                queue: self.name.clone(),
                message_id,
            })?;
        self.release(&delivery.reference)
    }

    /// Returns a delivered message to the head of the queue.
    pub fn cancel(&self, message_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let delivery = state
            .delivering
            .remove(&message_id)
            .ok_or_else(|| BrokerError::ReferenceNotFound {
                queue: self.name.clone(),
                message_id,
            })?;
        state.messages.push_front(delivery.reference);
        Ok(())
    }

    /// Removes expired waiting messages and returns copies re-addressed to
    /// `expiry_address` (none when it is unset).
    pub fn expire_references(&self, now: u64, expiry_address: Option<&str>) -> Result<Vec<Message>> {
        let expired: Vec<MessageReference> = {
            let mut state = self.state.lock();
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.messages)
                .into_iter()
                .partition(|r| r.message.is_expired(now));
            state.messages = kept.into();
            expired
        };

        let mut copies = Vec::new();
        for reference in &expired {
            self.release(reference)?;
            if let Some(address) = expiry_address {
                let id = self.persistence.journal().generate_unique_id();
                copies.push(reference.message.copy_with_rewritten_headers(id, address, "expired"));
            }
        }
        if !expired.is_empty() {
            info!(queue = %self.name, expired = expired.len(), "messages expired");
        }
        Ok(copies)
    }

    /// Removes a waiting message for re-routing elsewhere. This queue's hold
    /// is released and the caller gets a copy under a fresh ID.
    pub fn take(&self, message_id: u64) -> Result<Option<Message>> {
        let reference = {
            let mut state = self.state.lock();
            match state.messages.iter().position(|r| r.message_id() == message_id) {
                Some(idx) => state.messages.remove(idx),
                None => None,
            }
        };
        match reference {
            Some(reference) => {
                self.release(&reference)?;
                let id = self.persistence.journal().generate_unique_id();
                Ok(Some(reference.message.copy_with_new_id(id)))
            }
            None => Ok(None),
        }
    }

    /// Releases every waiting and in-flight message; used when the queue is
    /// destroyed. Returns how many were released.
    pub fn drain(&self) -> Result<usize> {
        let references: Vec<MessageReference> = {
            let mut state = self.state.lock();
            let mut all: Vec<_> = state.messages.drain(..).collect();
            all.extend(state.delivering.drain().map(|(_, d)| d.reference));
            all
        };
        for reference in &references {
            self.release(reference)?;
        }
        Ok(references.len())
    }

    // Called without the state lock: releasing memory may depage into this queue.
    fn release(&self, reference: &MessageReference) -> Result<()> {
        let message = &reference.message;
        let durable = message.durable && self.durable;
        let remaining = message.decrement_refs(durable);
        self.store.add_size(-message.memory_estimate());

        if let Some(origin) = &reference.paged {
            origin.cursor.ack(origin.position, self.id)?;
        } else if durable {
            self.persistence
                .acknowledge(message.message_id, self.id, remaining)?;
        }
        Ok(())
    }
}

impl Bindable for Queue {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self, _message: &Message, ctx: &mut RoutingContext) -> Result<()> {
        ctx.add_queue(self.id);
        Ok(())
    }

    fn is_high_accept_priority(&self, _message: &Message) -> bool {
        self.consumer_count() > 0
    }
}

/// Queues by ID and by name.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    by_id: DashMap<u64, Arc<Queue>>,
    by_name: DashMap<String, u64>,
}

impl QueueRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queue; its name must be unused.
    pub fn insert(&self, queue: Arc<Queue>) -> Result<()> {
        match self.by_name.entry(queue.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BrokerError::QueueExists {
                name: queue.name().to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(queue.id());
                self.by_id.insert(queue.id(), queue);
                Ok(())
            }
        }
    }

    /// Looks up by ID.
    pub fn get(&self, id: u64) -> Option<Arc<Queue>> {
        self.by_id.get(&id).map(|q| Arc::clone(q.value()))
    }

    /// Looks up by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Queue>> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    /// Unregisters by name.
    pub fn remove(&self, name: &str) -> Option<Arc<Queue>> {
        let (_, id) = self.by_name.remove(name)?;
        self.by_id.remove(&id).map(|(_, q)| q)
    }

    /// Every queue, ordered by ID.
    pub fn all(&self) -> Vec<Arc<Queue>> {
        let mut queues: Vec<_> = self.by_id.iter().map(|q| Arc::clone(q.value())).collect();
        queues.sort_by_key(|q| q.id());
        queues
    }

    /// Number of queues.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Force-closes consumers that stopped showing signs of life.
#[derive(Debug, Clone)]
pub struct ConsumerReaper {
    queues: Arc<QueueRegistry>,
    notifications: Arc<NotificationService>,
    ttl: Duration,
}

impl ConsumerReaper {
    /// Creates a reaper for consumers idle longer than `ttl`.
    pub fn new(
        queues: Arc<QueueRegistry>,
        notifications: Arc<NotificationService>,
        ttl: Duration,
    ) -> Self {
        Self {
            queues,
            notifications,
            ttl,
        }
    }

    /// Closes every idle consumer; returns how many were closed.
    pub fn reap(&self, now: u64) -> usize {
        let mut closed = 0;
        for queue in self.queues.all() {
            for consumer_id in queue.idle_consumers(now, self.ttl) {
                let returned = queue.remove_consumer(consumer_id);
                warn!(
                    queue = %queue.name(),
                    consumer_id,
                    returned,
                    "closing idle consumer"
                );
                self.notifications.send(Notification::ConsumerClosed {
                    queue: queue.name().to_string(),
                    consumer_id,
                });
                closed += 1;
            }
        }
        closed
    }

    /// Runs [`reap`](Self::reap) every `period`.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.reap(now_millis());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressSettings;
    use crate::executor::DirectExecutor;
    use crate::notifications::{NotificationListener, NotificationType};
    use crate::paging::{PagingManager, PagingManagerConfig};
    use harbormq_storage::{InMemoryJournal, Journal};

    struct Fixture {
        _dir: tempfile::TempDir,
        journal: Arc<InMemoryJournal>,
        persistence: Arc<MessagePersistence>,
        paging: PagingManager,
        registry: Arc<QueueRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let journal = Arc::new(InMemoryJournal::new());
            let registry = Arc::new(QueueRegistry::new());
            let paging = PagingManager::new(
                PagingManagerConfig {
                    root: dir.path().to_path_buf(),
                    global_max_size: -1,
                    default_settings: AddressSettings::default(),
                    overrides: HashMap::new(),
                },
                journal.clone(),
                Arc::new(DirectExecutor),
                &registry,
            );
            Self {
                _dir: dir,
                persistence: Arc::new(MessagePersistence::new(journal.clone())),
                journal,
                paging,
                registry,
            }
        }

        fn queue(&self, id: u64, durable: bool) -> Arc<Queue> {
            let queue = Arc::new(Queue::new(
                id,
                format!("q{id}"),
                "a",
                durable,
                self.persistence.clone(),
                self.paging.get_or_create("a"),
            ));
            self.registry.insert(queue.clone()).unwrap();
            queue
        }

        fn durable_message(&self, queues: &[u64]) -> Arc<Message> {
            let mut message = Message::new("a", "payload").with_durable(true);
            message.message_id = self.journal.generate_unique_id();
            self.persistence.store_message(&message, queues, None).unwrap();
            Arc::new(message)
        }
    }

    #[test]
    fn test_poll_and_acknowledge() {
        let fx = Fixture::new();
        let queue = fx.queue(1, true);
        let message = fx.durable_message(&[1]);
        queue.add_reference(MessageReference::new(message.clone(), 1));
        assert!(fx.paging.get_or_create("a").size() > 0);

        let consumer = queue.add_consumer();
        let delivered = queue.poll(consumer).unwrap().unwrap();
        assert_eq!(delivered.delivery_count, 1);
        assert_eq!(queue.delivering_count(), 1);

        queue.acknowledge(delivered.message_id()).unwrap();
        assert_eq!(queue.delivering_count(), 0);
        assert_eq!(message.ref_count(), 0);
        assert_eq!(fx.paging.get_or_create("a").size(), 0);
        assert!(fx.journal.records().is_empty());
    }

    #[test]
    fn test_message_record_survives_until_last_durable_ack() {
        let fx = Fixture::new();
        let q1 = fx.queue(1, true);
        let q2 = fx.queue(2, true);
        let message = fx.durable_message(&[1, 2]);
        q1.add_reference(MessageReference::new(message.clone(), 1));
        q2.add_reference(MessageReference::new(message.clone(), 2));

        let c1 = q1.add_consumer();
        let m = q1.poll(c1).unwrap().unwrap();
        q1.acknowledge(m.message_id()).unwrap();
        assert!(fx
            .journal
            .records()
            .iter()
            .any(|r| r.id == message.message_id));

        let c2 = q2.add_consumer();
        let m = q2.poll(c2).unwrap().unwrap();
        q2.acknowledge(m.message_id()).unwrap();
        assert!(fx.journal.records().is_empty());
    }

    #[test]
    fn test_acknowledge_unknown_message() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        assert!(matches!(
            queue.acknowledge(77),
            Err(BrokerError::ReferenceNotFound { message_id: 77, .. })
        ));
    }

    #[test]
    fn test_poll_requires_consumer() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        assert!(matches!(queue.poll(9), Err(BrokerError::IllegalState(_))));
    }

    #[test]
    fn test_cancel_returns_to_head() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        for _ in 0..2 {
            let mut m = Message::new("a", "x");
            m.message_id = fx.journal.generate_unique_id();
            queue.add_reference(MessageReference::new(Arc::new(m), 1));
        }
        let consumer = queue.add_consumer();
        let first = queue.poll(consumer).unwrap().unwrap();
        queue.cancel(first.message_id()).unwrap();
        let again = queue.poll(consumer).unwrap().unwrap();
        assert_eq!(again.message_id(), first.message_id());
        assert_eq!(again.delivery_count, 2);
    }

    #[test]
    fn test_expire_references_makes_copies() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        let mut m = Message::new("a", "x").with_expiration(10);
        m.message_id = fx.journal.generate_unique_id();
        queue.add_reference(MessageReference::new(Arc::new(m), 1));

        let copies = queue.expire_references(11, Some("expiry")).unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].address, "expiry");
        assert_eq!(queue.message_count(), 0);
        assert!(queue.expire_references(11, None).unwrap().is_empty());
    }

    #[test]
    fn test_remove_consumer_returns_in_flight() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        for _ in 0..3 {
            let mut m = Message::new("a", "x");
            m.message_id = fx.journal.generate_unique_id();
            queue.add_reference(MessageReference::new(Arc::new(m), 1));
        }
        let consumer = queue.add_consumer();
        let a = queue.poll(consumer).unwrap().unwrap();
        let _b = queue.poll(consumer).unwrap().unwrap();
        assert_eq!(queue.remove_consumer(consumer), 2);
        assert_eq!(queue.message_count(), 3);

        let other = queue.add_consumer();
        assert_eq!(queue.poll(other).unwrap().unwrap().message_id(), a.message_id());
    }

    #[derive(Default)]
    struct Closed(Mutex<Vec<u64>>);

    impl NotificationListener for Closed {
        fn on_notification(&self, notification: &Notification) {
            if let Notification::ConsumerClosed { consumer_id, .. } = notification {
                self.0.lock().push(*consumer_id);
            }
        }
    }

    #[test]
    fn test_reaper_closes_idle_consumers() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        let notifications = Arc::new(NotificationService::new());
        let closed = Arc::new(Closed::default());
        notifications.subscribe(&[NotificationType::ConsumerClosed], &closed);

        let stale = queue.add_consumer();
        let reaper = ConsumerReaper::new(
            fx.registry.clone(),
            notifications,
            Duration::from_millis(1_000),
        );
        assert_eq!(reaper.reap(now_millis()), 0);
        assert_eq!(reaper.reap(now_millis() + 5_000), 1);
        assert_eq!(*closed.0.lock(), vec![stale]);
        assert_eq!(queue.consumer_count(), 0);
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let fx = Fixture::new();
        let queue = fx.queue(1, false);
        assert!(matches!(
            fx.registry.insert(queue.clone()),
            Err(BrokerError::QueueExists { .. })
        ));
        assert_eq!(fx.registry.get_by_name("q1").map(|q| q.id()), Some(1));
        assert!(fx.registry.remove("q1").is_some());
        assert!(fx.registry.is_empty());
    }
}
