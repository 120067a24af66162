//! Error types for the broker.

use harbormq_storage::StorageError;
use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced to message-send and delivery callers.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Journal or page I/O failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error outside the storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A queue named by routing or grouping no longer exists.
    #[error("queue not found: {name}")]
    QueueNotFound {
        /// Queue or cluster name that could not be resolved.
        name: String,
    },

    /// A queue with this name already exists.
    #[error("queue already exists: {name}")]
    QueueExists {
        /// The conflicting queue name.
        name: String,
    },

    /// A binding ID is already present in the table.
    #[error("binding already exists: {binding_id}")]
    BindingExists {
        /// The conflicting binding ID.
        binding_id: u64,
    },

    /// No binding with this ID exists.
    #[error("binding not found: {binding_id}")]
    BindingNotFound {
        /// The missing binding ID.
        binding_id: u64,
    },

    /// No response arrived for a group proposal before the deadline.
    #[error("timed out after {timeout_ms}ms waiting for grouping response to {group_id}")]
    GroupingTimeout {
        /// The group being proposed.
        group_id: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The address is full and its policy is to fail sends.
    #[error("address {address} is full ({size} bytes, max {max_size})")]
    AddressFull {
        /// The full address.
        address: String,
        /// Current size estimate.
        size: i64,
        /// Configured maximum.
        max_size: i64,
    },

    /// A message filter expression could not be parsed.
    #[error("invalid filter {expression:?}: {reason}")]
    InvalidFilter {
        /// The offending expression.
        expression: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No delivering reference with this message ID.
    #[error("message {message_id} is not being delivered by queue {queue}")]
    ReferenceNotFound {
        /// Queue name.
        queue: String,
        /// Message ID.
        message_id: u64,
    },

    /// Mirroring to the backup failed.
    #[error("replication error: {0}")]
    Replication(#[from] harbormq_repl::ReplError),

    /// Broker state is inconsistent; not retryable.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl BrokerError {
    /// True for errors a sender may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Storage(_) | BrokerError::Io(_) | BrokerError::AddressFull { .. }
        )
    }
}
