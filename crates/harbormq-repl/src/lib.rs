#![warn(missing_docs)]

//! HarborMQ replication subsystem: mirrors journal and page files from a live
//! node to a backup, and promotes the backup when the live node goes away.

pub mod backup;
pub mod conduit;
pub mod error;
pub mod failover;
pub mod live;
pub mod packet;

pub use backup::BackupReplica;
pub use conduit::{Conduit, ConduitState, ConduitStats};
pub use error::ReplError;
pub use failover::{FailoverConfig, FailoverCoordinator, FailoverEvent, LiveState, PromotedNode};
pub use live::{LiveReplicator, SyncSummary};
pub use packet::{ReplicationFrame, ReplicationPacket};
