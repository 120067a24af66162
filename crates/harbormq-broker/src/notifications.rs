//! Cluster notification bus.
//!
//! Publish/subscribe by [`NotificationType`]. Dispatch is synchronous on the
//! sender's thread and listeners may send further notifications while being
//! dispatched to (the grouping arbiter answers a proposal this way).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

/// Notification categories listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// A node asks the arbiter to pin a group.
    Proposal,
    /// The arbiter's decision for a group.
    ProposalResponse,
    /// A binding was added.
    BindingAdded,
    /// A binding was removed.
    BindingRemoved,
    /// A consumer was closed by the broker.
    ConsumerClosed,
}

/// A cluster event.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Group proposal.
    Proposal {
        /// Group being proposed.
        group_id: String,
        /// Cluster name of the proposed binding.
        cluster_name: String,
    },
    /// Group decision.
    ProposalResponse {
        /// Group decided.
        group_id: String,
        /// Cluster name originally proposed.
        cluster_name: String,
        /// Cluster name the arbiter chose instead, if different.
        alternative_cluster_name: Option<String>,
    },
    /// Binding added.
    BindingAdded {
        /// Address of the binding.
        address: String,
        /// Cluster name of the binding.
        cluster_name: String,
        /// Binding ID.
        binding_id: u64,
        /// Hop count.
        distance: u32,
    },
    /// Binding removed.
    BindingRemoved {
        /// Address of the binding.
        address: String,
        /// Cluster name of the binding.
        cluster_name: String,
        /// Binding ID.
        binding_id: u64,
    },
    /// Consumer force-closed.
    ConsumerClosed {
        /// Queue the consumer was attached to.
        queue: String,
        /// Consumer ID.
        consumer_id: u64,
    },
}

impl Notification {
    /// Category of this notification.
    pub fn kind(&self) -> NotificationType {
        match self {
            Notification::Proposal { .. } => NotificationType::Proposal,
            Notification::ProposalResponse { .. } => NotificationType::ProposalResponse,
            Notification::BindingAdded { .. } => NotificationType::BindingAdded,
            Notification::BindingRemoved { .. } => NotificationType::BindingRemoved,
            Notification::ConsumerClosed { .. } => NotificationType::ConsumerClosed,
        }
    }
}

/// Receives notifications.
pub trait NotificationListener: Send + Sync {
    /// Handles one notification.
    fn on_notification(&self, notification: &Notification);
}

struct Subscription {
    id: u64,
    types: HashSet<NotificationType>,
    listener: Weak<dyn NotificationListener>,
}

/// Notification bus. Listeners are held weakly.
#[derive(Default)]
pub struct NotificationService {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationService")
            .field("listeners", &self.subscriptions.read().len())
            .finish()
    }
}

impl NotificationService {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to `types`; returns a subscription ID.
    pub fn subscribe<L>(&self, types: &[NotificationType], listener: &Arc<L>) -> u64
    where
        L: NotificationListener + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<L> = Arc::downgrade(listener);
        self.subscriptions.write().push(Subscription {
            id,
            types: types.iter().copied().collect(),
            listener: weak,
        });
        id
    }

    /// Removes a subscription; false if it was unknown.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.listener.strong_count() > 0)
            .count()
    }

    /// Dispatches `notification` to every interested listener.
    pub fn send(&self, notification: Notification) {
        let kind = notification.kind();
        let targets: Vec<Arc<dyn NotificationListener>> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|s| s.types.contains(&kind))
                .filter_map(|s| s.listener.upgrade())
                .collect()
        };
        trace!(?kind, listeners = targets.len(), "dispatching notification");
        for listener in targets {
            listener.on_notification(&notification);
        }
        self.subscriptions
            .write()
            .retain(|s| s.listener.strong_count() > 0);
    }
}
