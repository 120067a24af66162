//! Per-message routing result.

/// Queues chosen for one message.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    queue_ids: Vec<u64>,
    tx_id: Option<u64>,
}

impl RoutingContext {
    /// Creates an empty context for a send in transaction `tx_id`.
    pub fn new(tx_id: Option<u64>) -> Self {
        Self {
            queue_ids: Vec::new(),
            tx_id,
        }
    }

    /// Adds a target queue; repeated IDs are ignored.
    pub fn add_queue(&mut self, queue_id: u64) {
        if !self.queue_ids.contains(&queue_id) {
            self.queue_ids.push(queue_id);
        }
    }

    /// Target queues in the order they were chosen.
    pub fn queue_ids(&self) -> &[u64] {
        &self.queue_ids
    }

    /// Number of target queues.
    pub fn len(&self) -> usize {
        self.queue_ids.len()
    }

    /// True when no queue was chosen.
    pub fn is_empty(&self) -> bool {
        self.queue_ids.is_empty()
    }

    /// Transaction of the send, if any.
    pub fn tx_id(&self) -> Option<u64> {
        self.tx_id
    }

    /// Forgets chosen queues so the context can be reused.
    pub fn clear(&mut self) {
        self.queue_ids.clear();
    }
}
