//! Error types for the replication subsystem.

use harbormq_storage::StorageError;
use thiserror::Error;

/// Errors raised while replicating or promoting.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The conduit is closed or the peer is gone.
    #[error("network error: {msg}")]
    NetworkError {
        /// Error message.
        msg: String,
    },

    /// A frame arrived out of sequence.
    #[error("out of order frame: expected seq {expected}, got {got}")]
    OutOfOrder {
        /// The sequence number the backup was waiting for.
        expected: u64,
        /// The sequence number that arrived.
        got: u64,
    },

    /// The backup has not received a full snapshot yet.
    #[error("backup is not synchronized with the live node")]
    NotSynchronized,

    /// Replication was shut down.
    #[error("replication shut down")]
    Shutdown,

    /// Applying a mirrored op to local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
