//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The requested journal record does not exist.
    #[error("Record not found: {record_id}")]
    RecordNotFound {
        /// The record ID that was not found.
        record_id: u64,
    },

    /// A record with this ID is already live in the journal.
    #[error("Duplicate record id: {record_id}")]
    DuplicateRecord {
        /// The conflicting record ID.
        record_id: u64,
    },

    /// The transaction is not in a state that allows the operation.
    #[error("Invalid transaction state: tx {tx_id} is {state}")]
    InvalidTransactionState {
        /// The transaction ID.
        tx_id: u64,
        /// The current state of the transaction.
        state: &'static str,
    },

    /// The transaction was marked rollback-only and has been rolled back.
    #[error("Transaction {tx_id} is rollback-only: {reason}")]
    TransactionRollbackOnly {
        /// The transaction ID.
        tx_id: u64,
        /// Why the transaction was marked rollback-only.
        reason: String,
    },

    /// A page file is unreadable beyond torn-tail recovery.
    #[error("Corrupted page {page_id}: {reason}")]
    CorruptedPage {
        /// The page number.
        page_id: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// The journal or page has already been closed.
    #[error("{what} is closed")]
    Closed {
        /// Which resource was closed.
        what: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_result_alias() {
        let ok: StorageResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StorageResult<i32> = Err(StorageError::RecordNotFound { record_id: 7 });
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = std_err.into();
        assert!(matches!(storage_err, StorageError::IoError(_)));
    }

    #[test]
    fn test_record_not_found_display() {
        let err = StorageError::RecordNotFound { record_id: 42 };
        assert_eq!(format!("{}", err), "Record not found: 42");
    }

    #[test]
    fn test_rollback_only_display() {
        let err = StorageError::TransactionRollbackOnly {
            tx_id: 9,
            reason: "duplicate id".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("9"));
        assert!(msg.contains("duplicate id"));
    }

    #[test]
    fn test_corrupted_page_display() {
        let err = StorageError::CorruptedPage {
            page_id: 3,
            reason: "bad magic".to_string(),
        };
        assert_eq!(format!("{}", err), "Corrupted page 3: bad magic");
    }
}
