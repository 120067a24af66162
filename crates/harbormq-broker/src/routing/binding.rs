//! Bindings and the targets behind them.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;
use crate::routing::context::RoutingContext;
use crate::routing::filter::Filter;

/// A routing target: a local queue or a cluster bridge.
pub trait Bindable: Send + Sync {
    /// Target ID (the queue ID for local queues).
    fn id(&self) -> u64;

    /// Unique target name.
    fn name(&self) -> &str;

    /// Adjusts the message before it is routed here.
    fn preroute(&self, _message: &mut Message, _ctx: &mut RoutingContext) -> Result<()> {
        Ok(())
    }

    /// Records this target in the routing context.
    fn route(&self, message: &Message, ctx: &mut RoutingContext) -> Result<()>;

    /// False while the target cannot accept messages.
    fn will_route(&self) -> bool {
        true
    }

    /// True when the target has consumers ready for `message`.
    fn is_high_accept_priority(&self, message: &Message) -> bool;
}

/// Routing-table entry mapping an address to a [`Bindable`].
#[derive(Clone)]
pub struct Binding {
    /// Unique binding ID.
    pub id: u64,
    /// Unique name, defaults to the bindable's name.
    pub unique_name: String,
    /// Key grouping competing bindings.
    pub routing_name: String,
    /// Bound address.
    pub address: String,
    /// Exclusive bindings receive every matching message.
    pub exclusive: bool,
    /// Hops to the target; 0 for local queues.
    pub distance: u32,
    /// Name used by grouping to identify the target across the cluster.
    pub cluster_name: String,
    /// Optional selector.
    pub filter: Option<Filter>,
    /// The target.
    pub bindable: Arc<dyn Bindable>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("unique_name", &self.unique_name)
            .field("routing_name", &self.routing_name)
            .field("address", &self.address)
            .field("exclusive", &self.exclusive)
            .field("distance", &self.distance)
            .field("filter", &self.filter)
            .finish()
    }
}

impl Binding {
    /// Creates a non-exclusive, local, unfiltered binding.
    pub fn new(
        id: u64,
        address: impl Into<String>,
        routing_name: impl Into<String>,
        bindable: Arc<dyn Bindable>,
    ) -> Self {
        let unique_name = bindable.name().to_string();
        Self {
            id,
            cluster_name: unique_name.clone(),
            unique_name,
            routing_name: routing_name.into(),
            address: address.into(),
            exclusive: false,
            distance: 0,
            filter: None,
            bindable,
        }
    }

    /// Sets the selector.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Marks the binding exclusive.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the hop count.
    pub fn with_distance(mut self, distance: u32) -> Self {
        self.distance = distance;
        self
    }

    /// Overrides the cluster name.
    pub fn with_cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = cluster_name.into();
        self
    }

    /// True when the selector (if any) accepts `message`.
    pub fn matches(&self, message: &Message) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(message))
    }

    /// Runs `preroute` then `route` on the target.
    pub(crate) fn deliver(&self, message: &mut Message, ctx: &mut RoutingContext) -> Result<()> {
        self.bindable.preroute(message, ctx)?;
        self.bindable.route(message, ctx)
    }
}
