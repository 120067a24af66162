//! Cluster link bindings.
//!
//! A queue on a peer node is represented locally by a [`RemoteQueueBinding`].
//! Routing to it tags the message with the peer's queue ID and parks it in the
//! local store-and-forward queue that feeds the cluster bridge; the peer routes
//! it straight to that queue through the route-to property.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::error::Result;
use crate::message::Message;
use crate::routing::{Bindable, RoutingContext};

/// A queue on another node.
#[derive(Debug)]
pub struct RemoteQueueBinding {
    id: u64,
    name: String,
    remote_queue_id: u64,
    store_and_forward_queue_id: u64,
    consumer_count: AtomicU32,
}

impl RemoteQueueBinding {
    /// Creates the binding target.
    ///
    /// `store_and_forward_queue_id` names the local queue drained by the
    /// bridge to the peer.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        remote_queue_id: u64,
        store_and_forward_queue_id: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            remote_queue_id,
            store_and_forward_queue_id,
            consumer_count: AtomicU32::new(0),
        }
    }

    /// ID of the queue on the peer.
    pub fn remote_queue_id(&self) -> u64 {
        self.remote_queue_id
    }

    /// Local queue the bridge forwards from.
    pub fn store_and_forward_queue_id(&self) -> u64 {
        self.store_and_forward_queue_id
    }

    /// Consumers the peer advertised for its queue.
    pub fn consumer_count(&self) -> u32 {
        self.consumer_count.load(Ordering::Acquire)
    }

    /// Records a consumer-count update from the peer.
    pub fn set_consumer_count(&self, count: u32) {
        self.consumer_count.store(count, Ordering::Release);
        debug!(binding = %self.name, count, "remote consumer count updated");
    }
}

impl Bindable for RemoteQueueBinding {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn preroute(&self, message: &mut Message, _ctx: &mut RoutingContext) -> Result<()> {
        message.add_route_to_id(self.remote_queue_id);
        Ok(())
    }

    fn route(&self, _message: &Message, ctx: &mut RoutingContext) -> Result<()> {
        ctx.add_queue(self.store_and_forward_queue_id);
        Ok(())
    }

    fn is_high_accept_priority(&self, _message: &Message) -> bool {
        self.consumer_count() > 0
    }
}
