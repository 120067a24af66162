#![warn(missing_docs)]

//! HarborMQ broker: routing, duplicate detection, paging and message grouping
//!
//! Messages sent to an address pass the duplicate-id cache, are routed to the
//! queues bound to that address, and are either delivered directly or spilled
//! to page files when the address exceeds its memory budget. Grouped messages
//! are pinned to one queue through a cluster-wide proposal protocol.

pub mod broker;
pub mod cluster;
pub mod config;
pub mod duplicate_cache;
pub mod error;
pub mod executor;
pub mod grouping;
pub mod message;
pub mod notifications;
pub mod paging;
pub mod persistence;
pub mod post_office;
pub mod queue;
pub mod routing;

pub use broker::Broker;
pub use config::{AddressFullPolicy, AddressSettings, BrokerConfig, QueueConfig};
pub use error::{BrokerError, Result};
pub use message::{Message, MessageReference, Value};
pub use post_office::{PostOffice, RoutingStatus};
pub use queue::Queue;
