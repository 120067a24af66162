//! Per-address binding table.
//!
//! Bindings that share a routing name compete for each message through a
//! round-robin cursor owned by that routing name; exclusive bindings bypass
//! the competition and all receive every message they match.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::grouping::{GroupingHandler, Proposal};
use crate::message::{keys, Message};
use crate::routing::binding::Binding;
use crate::routing::context::RoutingContext;

/// Bindings sharing one routing name plus their round-robin position.
#[derive(Default)]
struct RoutingGroup {
    bindings: RwLock<Vec<Arc<Binding>>>,
    position: Mutex<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Selection {
    Route { when_no_consumers: bool },
    Redistribute { exclude: u64 },
}

/// The bindings of one address.
pub struct Bindings {
    address: String,
    groups: DashMap<String, Arc<RoutingGroup>>,
    exclusive: RwLock<Vec<Arc<Binding>>>,
    by_id: DashMap<u64, Arc<Binding>>,
    route_when_no_consumers: AtomicBool,
    grouping: RwLock<Option<Arc<dyn GroupingHandler>>>,
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("address", &self.address)
            .field("bindings", &self.by_id.len())
            .field("routing_names", &self.groups.len())
            .finish()
    }
}

impl Bindings {
    /// Creates an empty table for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            groups: DashMap::new(),
            exclusive: RwLock::new(Vec::new()),
            by_id: DashMap::new(),
            route_when_no_consumers: AtomicBool::new(false),
            grouping: RwLock::new(None),
        }
    }

    /// The address these bindings belong to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Routes to bindings even when they have no ready consumers.
    pub fn set_route_when_no_consumers(&self, enabled: bool) {
        self.route_when_no_consumers.store(enabled, Ordering::Relaxed);
    }

    /// Installs the handler consulted for grouped messages.
    pub fn set_grouping_handler(&self, handler: Option<Arc<dyn GroupingHandler>>) {
        *self.grouping.write() = handler;
    }

    /// Adds a binding; its ID must be new to this table.
    pub fn add_binding(&self, binding: Arc<Binding>) -> Result<()> {
        let id = binding.id;
        match self.by_id.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BrokerError::BindingExists { binding_id: id })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if binding.exclusive {
                    self.exclusive.write().push(Arc::clone(&binding));
                } else {
                    let group = self.groups.entry(binding.routing_name.clone()).or_default();
                    group.bindings.write().push(Arc::clone(&binding));
                }
                debug!(
                    address = %self.address,
                    binding_id = id,
                    routing_name = %binding.routing_name,
                    exclusive = binding.exclusive,
                    "binding added"
                );
                slot.insert(binding);
            }
        }
        Ok(())
    }

    /// Removes a binding by ID.
    pub fn remove_binding(&self, binding_id: u64) -> Result<Arc<Binding>> {
        let (_, binding) = self
            .by_id
            .remove(&binding_id)
            .ok_or(BrokerError::BindingNotFound { binding_id })?;

        if binding.exclusive {
            self.exclusive.write().retain(|b| b.id != binding_id);
        } else {
            if let Some(group) = self.groups.get(&binding.routing_name) {
                group.bindings.write().retain(|b| b.id != binding_id);
            }
            self.groups
                .remove_if(&binding.routing_name, |_, g| g.bindings.read().is_empty());
        }
        debug!(address = %self.address, binding_id, "binding removed");
        Ok(binding)
    }

    /// Looks up a binding.
    pub fn binding(&self, binding_id: u64) -> Option<Arc<Binding>> {
        self.by_id.get(&binding_id).map(|b| Arc::clone(b.value()))
    }

    /// All bindings, ordered by ID.
    pub fn bindings(&self) -> Vec<Arc<Binding>> {
        let mut all: Vec<_> = self.by_id.iter().map(|b| Arc::clone(b.value())).collect();
        all.sort_by_key(|b| b.id);
        all
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Chooses targets for `message` and records them in `ctx`.
    ///
    /// Returns false when nothing was routed, including when a route-to
    /// binding ID can no longer be resolved.
    pub fn route(&self, message: &mut Message, ctx: &mut RoutingContext) -> Result<bool> {
        if let Some(ids) = message.route_to_ids().map(<[u64]>::to_vec) {
            message.remove_property(keys::ROUTE_TO);
            return self.route_to_ids(message, &ids, ctx);
        }

        let exclusive: Vec<Arc<Binding>> = self
            .exclusive
            .read()
            .iter()
            .filter(|b| b.bindable.will_route() && b.matches(message))
            .cloned()
            .collect();
        if !exclusive.is_empty() {
            for binding in &exclusive {
                binding.deliver(message, ctx)?;
            }
            return Ok(true);
        }

        let grouping = self.grouping.read().clone();
        if let (Some(handler), Some(group_id)) = (grouping, message.group_id().map(str::to_string))
        {
            return self.route_grouped(message, &group_id, handler.as_ref(), ctx);
        }

        let mode = Selection::Route {
            when_no_consumers: self.route_when_no_consumers.load(Ordering::Relaxed),
        };
        let mut routed = false;
        for (_, group) in self.groups_snapshot() {
            if let Some(binding) = select(&group, message, mode) {
                binding.deliver(message, ctx)?;
                routed = true;
            }
        }
        Ok(routed)
    }

    /// Re-offers `message` from a consumer-less queue to a sibling binding
    /// with the same routing name that has ready consumers.
    pub fn redistribute(
        &self,
        message: &mut Message,
        originating_queue: u64,
        ctx: &mut RoutingContext,
    ) -> Result<bool> {
        let origin = self
            .by_id
            .iter()
            .find(|b| b.value().bindable.id() == originating_queue)
            .map(|b| Arc::clone(b.value()));
        let Some(origin) = origin else {
            return Ok(false);
        };
        let Some(group) = self
            .groups
            .get(&origin.routing_name)
            .map(|g| Arc::clone(g.value()))
        else {
            return Ok(false);
        };

        match select(&group, message, Selection::Redistribute { exclude: origin.id }) {
            Some(binding) => {
                debug!(
                    address = %self.address,
                    from = originating_queue,
                    to = binding.id,
                    "redistributing message"
                );
                binding.deliver(message, ctx)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn route_to_ids(
        &self,
        message: &mut Message,
        ids: &[u64],
        ctx: &mut RoutingContext,
    ) -> Result<bool> {
        let mut targets = Vec::with_capacity(ids.len());
        for &binding_id in ids {
            match self.binding(binding_id) {
                Some(binding) => targets.push(binding),
                None => {
                    warn!(
                        address = %self.address,
                        binding_id,
                        "route-to binding not found, message not routed"
                    );
                    return Ok(false);
                }
            }
        }
        for binding in &targets {
            binding.deliver(message, ctx)?;
        }
        Ok(!targets.is_empty())
    }

    fn route_grouped(
        &self,
        message: &mut Message,
        group_id: &str,
        handler: &dyn GroupingHandler,
        ctx: &mut RoutingContext,
    ) -> Result<bool> {
        let mode = Selection::Route {
            when_no_consumers: self.route_when_no_consumers.load(Ordering::Relaxed),
        };
        let mut routed = false;
        for (routing_name, group) in self.groups_snapshot() {
            let full_id = format!("{group_id}.{routing_name}");
            let response = match handler.get_proposal(&full_id) {
                Some(response) => response,
                None => {
                    let Some(candidate) = select(&group, message, mode) else {
                        continue;
                    };
                    handler.propose(Proposal::new(full_id, candidate.cluster_name.clone()))?
                }
            };

            let chosen = response.chosen_cluster_name();
            let binding = group
                .bindings
                .read()
                .iter()
                .find(|b| b.cluster_name == chosen)
                .cloned()
                .ok_or_else(|| BrokerError::QueueNotFound {
                    name: chosen.to_string(),
                })?;
            binding.deliver(message, ctx)?;
            routed = true;
        }
        Ok(routed)
    }

    fn groups_snapshot(&self) -> Vec<(String, Arc<RoutingGroup>)> {
        self.groups
            .iter()
            .map(|g| (g.key().clone(), Arc::clone(g.value())))
            .collect()
    }
}

/// One round-robin pass over a routing group.
///
/// The position lock is held for the whole scan so selections for one routing
/// name are serialized. The binding list is a snapshot; a position left out of
/// range by a concurrent removal restarts the scan at zero.
fn select(group: &RoutingGroup, message: &Message, mode: Selection) -> Option<Arc<Binding>> {
    let bindings = group.bindings.read().clone();
    let len = bindings.len();
    if len == 0 {
        return None;
    }

    let mut position = group.position.lock();
    if *position >= len {
        *position = 0;
    }
    let start = *position;
    let mut chosen = None;
    let mut fallback = None;

    for step in 0..len {
        let idx = (start + step) % len;
        let binding = &bindings[idx];
        if !binding.bindable.will_route() || !binding.matches(message) {
            continue;
        }
        match mode {
            Selection::Route { when_no_consumers } => {
                if len == 1
                    || when_no_consumers
                    || binding.bindable.is_high_accept_priority(message)
                {
                    chosen = Some(idx);
                    break;
                }
                if fallback.is_none() {
                    fallback = Some(idx);
                }
            }
            Selection::Redistribute { exclude } => {
                if binding.id != exclude && binding.bindable.is_high_accept_priority(message) {
                    chosen = Some(idx);
                    break;
                }
            }
        }
    }

    let picked = chosen.or(fallback);
    *position = match picked {
        Some(idx) => (idx + 1) % len,
        None => (start + 1) % len,
    };
    picked.map(|idx| Arc::clone(&bindings[idx]))
}
