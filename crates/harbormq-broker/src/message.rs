//! Message model: immutable payload, mutable property bag, per-queue references.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::paging::cursor::PagedOrigin;

/// Reserved property keys.
pub mod keys {
    /// Duplicate-detection identifier.
    pub const DUPLICATE_ID: &str = "_HMQ_DUPL_ID";
    /// Message group identifier.
    pub const GROUP_ID: &str = "_HMQ_GROUP_ID";
    /// Binding IDs chosen by a remote node for redistribution.
    pub const ROUTE_TO: &str = "_HMQ_ROUTE_TO";
    /// Address of the message a copy was made from.
    pub const ORIGINAL_ADDRESS: &str = "_HMQ_ORIG_ADDRESS";
    /// ID of the message a copy was made from.
    pub const ORIGINAL_MESSAGE_ID: &str = "_HMQ_ORIG_MESSAGE_ID";
    /// Queue the original message was taken from.
    pub const ORIGINAL_QUEUE: &str = "_HMQ_ORIG_QUEUE";
    /// Why a copy was made (expiry, dead letter).
    pub const COPY_REASON: &str = "_HMQ_COPY_REASON";
}

const MESSAGE_OVERHEAD: usize = 128;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Double-precision float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// List of unsigned IDs.
    LongList(Vec<u64>),
}

impl Value {
    fn size_estimate(&self) -> usize {
        match self {
            Value::Bool(_) => 1,
            Value::Int(_) => 4,
            Value::Long(_) | Value::Double(_) => 8,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::LongList(ids) => ids.len() * 8,
        }
    }

    /// Numeric view used by filter comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Reference counts shared by every handle to one stored message.
#[derive(Debug, Default)]
pub struct RefCounts {
    total: AtomicU32,
    durable: AtomicU32,
}

/// A message: immutable body plus mutable headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique ID, assigned at store time (0 until then).
    pub message_id: u64,
    /// Destination address.
    pub address: String,
    /// Whether the message must survive a restart.
    pub durable: bool,
    /// Expiration time in epoch milliseconds, 0 for never.
    pub expiration: u64,
    /// Creation time in epoch milliseconds.
    pub timestamp: u64,
    /// Delivery priority (0-9).
    pub priority: u8,
    properties: BTreeMap<String, Value>,
    body: Bytes,
    #[serde(skip)]
    refs: Arc<RefCounts>,
}

impl Message {
    /// Creates a non-durable message for `address`.
    pub fn new(address: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: 0,
            address: address.into(),
            durable: false,
            expiration: 0,
            timestamp: now_millis(),
            priority: 4,
            properties: BTreeMap::new(),
            body: body.into(),
            refs: Arc::new(RefCounts::default()),
        }
    }

    /// Sets durability.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the expiration time.
    pub fn with_expiration(mut self, expiration: u64) -> Self {
        self.expiration = expiration;
        self
    }

    /// Sets a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_property(key, value);
        self
    }

    /// Sets the duplicate-detection identifier.
    pub fn with_duplicate_id(self, id: impl Into<Vec<u8>>) -> Self {
        self.with_property(keys::DUPLICATE_ID, Value::Bytes(id.into()))
    }

    /// Sets the group identifier.
    pub fn with_group_id(self, group_id: impl Into<String>) -> Self {
        self.with_property(keys::GROUP_ID, Value::String(group_id.into()))
    }

    /// Payload.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// All properties.
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// A single property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Sets a property, replacing any previous value.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Removes a property.
    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Duplicate-detection identifier, if set.
    pub fn duplicate_id(&self) -> Option<Vec<u8>> {
        match self.properties.get(keys::DUPLICATE_ID)? {
            Value::Bytes(b) => Some(b.clone()),
            Value::String(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }

    /// Group identifier, if set.
    pub fn group_id(&self) -> Option<&str> {
        match self.properties.get(keys::GROUP_ID)? {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Binding IDs a remote node chose for this message.
    pub fn route_to_ids(&self) -> Option<&[u64]> {
        match self.properties.get(keys::ROUTE_TO)? {
            Value::LongList(ids) => Some(ids.as_slice()),
            _ => None,
        }
    }

    /// Appends a binding ID to the route-to marker.
    pub fn add_route_to_id(&mut self, binding_id: u64) {
        match self.properties.get_mut(keys::ROUTE_TO) {
            Some(Value::LongList(ids)) => ids.push(binding_id),
            _ => {
                self.properties
                    .insert(keys::ROUTE_TO.to_string(), Value::LongList(vec![binding_id]));
            }
        }
    }

    /// True once `now` passes the expiration time.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration != 0 && now >= self.expiration
    }

    /// Estimated in-memory footprint, used for address size accounting.
    pub fn memory_estimate(&self) -> i64 {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.size_estimate())
            .sum();
        (MESSAGE_OVERHEAD + self.address.len() + self.body.len() + props) as i64
    }

    /// A copy with a new ID and fresh reference counts; the body is shared.
    pub fn copy_with_new_id(&self, message_id: u64) -> Self {
        let mut copy = self.clone();
        copy.message_id = message_id;
        copy.refs = Arc::new(RefCounts::default());
        copy
    }

    /// A copy re-addressed to `new_address` that remembers where it came from.
    pub fn copy_with_rewritten_headers(
        &self,
        message_id: u64,
        new_address: &str,
        reason: &str,
    ) -> Self {
        let mut copy = self.copy_with_new_id(message_id);
        copy.set_property(keys::ORIGINAL_ADDRESS, self.address.as_str());
        copy.set_property(keys::ORIGINAL_MESSAGE_ID, self.message_id as i64);
        copy.set_property(keys::COPY_REASON, reason);
        copy.remove_property(keys::DUPLICATE_ID);
        copy.remove_property(keys::ROUTE_TO);
        copy.address = new_address.to_string();
        copy.expiration = 0;
        copy
    }

    /// Registers one more queue holding this message.
    pub fn increment_refs(&self, durable: bool) {
        self.refs.total.fetch_add(1, Ordering::AcqRel);
        if durable {
            self.refs.durable.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Releases one queue's hold; returns the durable references remaining.
    pub fn decrement_refs(&self, durable: bool) -> u32 {
        self.refs.total.fetch_sub(1, Ordering::AcqRel);
        if durable {
            self.refs.durable.fetch_sub(1, Ordering::AcqRel) - 1
        } else {
            self.refs.durable.load(Ordering::Acquire)
        }
    }

    /// Queues currently holding this message.
    pub fn ref_count(&self) -> u32 {
        self.refs.total.load(Ordering::Acquire)
    }

    /// Durable queues currently holding this message.
    pub fn durable_ref_count(&self) -> u32 {
        self.refs.durable.load(Ordering::Acquire)
    }
}

/// A message as held by one queue.
#[derive(Debug, Clone)]
pub struct MessageReference {
    /// The shared message.
    pub message: Arc<Message>,
    /// Owning queue.
    pub queue_id: u64,
    /// Delivery attempts so far.
    pub delivery_count: u32,
    /// Earliest delivery time in epoch milliseconds, 0 for immediate.
    pub scheduled_delivery_time: u64,
    /// Where the message came from if it was depaged.
    pub paged: Option<PagedOrigin>,
}

impl MessageReference {
    /// Creates a reference owned by `queue_id`.
    pub fn new(message: Arc<Message>, queue_id: u64) -> Self {
        Self {
            message,
            queue_id,
            delivery_count: 0,
            scheduled_delivery_time: 0,
            paged: None,
        }
    }

    /// Message ID.
    pub fn message_id(&self) -> u64 {
        self.message.message_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_with_rewritten_headers() {
        let mut original = Message::new("orders", "payload")
            .with_duplicate_id(b"abc".to_vec())
            .with_expiration(10);
        original.message_id = 42;

        let copy = original.copy_with_rewritten_headers(43, "expiry", "expired");
        assert_eq!(copy.message_id, 43);
        assert_eq!(copy.address, "expiry");
        assert_eq!(copy.expiration, 0);
        assert_eq!(
            copy.property(keys::ORIGINAL_ADDRESS),
            Some(&Value::String("orders".to_string()))
        );
        assert_eq!(copy.property(keys::ORIGINAL_MESSAGE_ID), Some(&Value::Long(42)));
        assert!(copy.duplicate_id().is_none());
        assert_eq!(copy.body(), original.body());
    }

    #[test]
    fn test_copy_has_fresh_ref_counts() {
        let original = Message::new("a", "x");
        original.increment_refs(true);
        let copy = original.copy_with_new_id(9);
        assert_eq!(original.ref_count(), 1);
        assert_eq!(copy.ref_count(), 0);
    }

    #[test]
    fn test_clone_shares_ref_counts() {
        let original = Message::new("a", "x");
        let clone = original.clone();
        clone.increment_refs(false);
        assert_eq!(original.ref_count(), 1);
    }

    #[test]
    fn test_durable_ref_counting() {
        let msg = Message::new("a", "x").with_durable(true);
        msg.increment_refs(true);
        msg.increment_refs(false);
        msg.increment_refs(true);

        assert_eq!(msg.decrement_refs(false), 2);
        assert_eq!(msg.decrement_refs(true), 1);
        assert_eq!(msg.decrement_refs(true), 0);
        assert_eq!(msg.ref_count(), 0);
    }

    #[test]
    fn test_route_to_ids_accumulate() {
        let mut msg = Message::new("a", "x");
        assert!(msg.route_to_ids().is_none());
        msg.add_route_to_id(3);
        msg.add_route_to_id(5);
        assert_eq!(msg.route_to_ids(), Some(&[3u64, 5][..]));
    }

    #[test]
    fn test_expiry() {
        let msg = Message::new("a", "x").with_expiration(1_000);
        assert!(!msg.is_expired(999));
        assert!(msg.is_expired(1_000));
        assert!(!Message::new("a", "x").is_expired(u64::MAX));
    }

    #[test]
    fn test_bincode_keeps_headers() {
        let msg = Message::new("a", vec![1u8, 2, 3])
            .with_group_id("G1")
            .with_property("color", "red");
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.group_id(), Some("G1"));
        assert_eq!(back.body().as_ref(), &[1, 2, 3]);
        assert_eq!(back.ref_count(), 0);
    }

    #[test]
    fn test_memory_estimate_grows_with_body() {
        let small = Message::new("a", vec![0u8; 10]);
        let big = Message::new("a", vec![0u8; 1000]);
        assert_eq!(big.memory_estimate() - small.memory_estimate(), 990);
    }
}
