//! Journal-backed transactions with post-commit callbacks.
//!
//! Components that must not expose state before a transaction is durable
//! (the duplicate-id cache, transactional message delivery) register a
//! [`TransactionOperation`] and do their in-memory work in `after_commit`.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::journal::Journal;

/// Callbacks fired at transaction boundaries.
pub trait TransactionOperation: Send {
    /// Runs before the journal commit; an error aborts the commit.
    fn before_commit(&mut self, _tx_id: u64) -> StorageResult<()> {
        Ok(())
    }

    /// Runs after a successful prepare.
    fn after_prepare(&mut self, _tx_id: u64) {}

    /// Runs after the journal commit is durable.
    fn after_commit(&mut self, _tx_id: u64) {}

    /// Runs after a rollback.
    fn after_rollback(&mut self, _tx_id: u64) {}
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting work.
    Active,
    /// Prepared; waiting for commit or rollback.
    Prepared,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

impl TransactionState {
    fn as_str(self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Prepared => "prepared",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        }
    }
}

/// A unit of work over a [`Journal`].
pub struct Transaction {
    id: u64,
    journal: Arc<dyn Journal>,
    state: TransactionState,
    operations: Vec<Box<dyn TransactionOperation>>,
    contains_persistent: bool,
    rollback_only: Option<String>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("operations", &self.operations.len())
            .field("contains_persistent", &self.contains_persistent)
            .finish()
    }
}

impl Transaction {
    /// Begins a transaction with an ID drawn from the journal.
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        let id = journal.generate_unique_id();
        debug!(tx_id = id, "transaction started");
        Self {
            id,
            journal,
            state: TransactionState::Active,
            operations: Vec::new(),
            contains_persistent: false,
            rollback_only: None,
        }
    }

    /// Transaction ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Registers a callback.
    pub fn add_operation(&mut self, operation: Box<dyn TransactionOperation>) {
        self.operations.push(operation);
    }

    /// Number of registered callbacks.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Marks that journal ops were issued under this transaction.
    pub fn set_contains_persistent(&mut self) {
        self.contains_persistent = true;
    }

    /// True if journal ops were issued under this transaction.
    pub fn contains_persistent(&self) -> bool {
        self.contains_persistent
    }

    /// Forces the eventual commit to fail and roll back.
    pub fn mark_rollback_only(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(tx_id = self.id, reason = %reason, "transaction marked rollback-only");
        self.rollback_only = Some(reason);
    }

    /// True once marked rollback-only.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.is_some()
    }

    /// Prepares the transaction and fires `after_prepare`.
    pub fn prepare(&mut self) -> StorageResult<()> {
        self.expect_state(TransactionState::Active)?;
        if let Some(reason) = self.rollback_only.clone() {
            self.rollback()?;
            return Err(StorageError::TransactionRollbackOnly {
                tx_id: self.id,
                reason,
            });
        }
        self.state = TransactionState::Prepared;
        for op in &mut self.operations {
            op.after_prepare(self.id);
        }
        Ok(())
    }

    /// Commits: journal commit (if persistent work exists), then `after_commit`.
    pub fn commit(&mut self) -> StorageResult<()> {
        if self.state != TransactionState::Active && self.state != TransactionState::Prepared {
            return Err(self.state_error());
        }
        if let Some(reason) = self.rollback_only.clone() {
            self.rollback()?;
            return Err(StorageError::TransactionRollbackOnly {
                tx_id: self.id,
                reason,
            });
        }

        for op in &mut self.operations {
            op.before_commit(self.id)?;
        }
        if self.contains_persistent {
            self.journal.commit(self.id)?;
        }
        self.state = TransactionState::Committed;
        for op in &mut self.operations {
            op.after_commit(self.id);
        }
        debug!(tx_id = self.id, operations = self.operations.len(), "transaction committed");
        Ok(())
    }

    /// Rolls back: journal rollback (if persistent work exists), then `after_rollback`.
    pub fn rollback(&mut self) -> StorageResult<()> {
        if self.state != TransactionState::Active && self.state != TransactionState::Prepared {
            return Err(self.state_error());
        }
        if self.contains_persistent {
            if let Err(e) = self.journal.rollback(self.id) {
                warn!(tx_id = self.id, error = %e, "journal rollback failed");
                return Err(e);
            }
        }
        self.state = TransactionState::RolledBack;
        for op in &mut self.operations {
            op.after_rollback(self.id);
        }
        debug!(tx_id = self.id, "transaction rolled back");
        Ok(())
    }

    fn expect_state(&self, expected: TransactionState) -> StorageResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.state_error())
        }
    }

    fn state_error(&self) -> StorageError {
        StorageError::InvalidTransactionState {
            tx_id: self.id,
            state: self.state.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{InMemoryJournal, JournalRecord, RecordKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<&'static str>>);

    struct Recorder(Arc<Events>);

    impl TransactionOperation for Recorder {
        fn after_prepare(&mut self, _tx_id: u64) {
            self.0 .0.lock().push("prepare");
        }
        fn after_commit(&mut self, _tx_id: u64) {
            self.0 .0.lock().push("commit");
        }
        fn after_rollback(&mut self, _tx_id: u64) {
            self.0 .0.lock().push("rollback");
        }
    }

    fn setup() -> (Arc<InMemoryJournal>, Arc<Events>) {
        (Arc::new(InMemoryJournal::new()), Arc::new(Events::default()))
    }

    #[test]
    fn test_commit_fires_callbacks_after_journal_commit() {
        let (journal, events) = setup();
        let mut tx = Transaction::new(journal.clone());
        let id = journal.generate_unique_id();
        journal
            .store_transactional(tx.id(), JournalRecord::new(id, RecordKind::Message, vec![]))
            .unwrap();
        tx.set_contains_persistent();
        tx.add_operation(Box::new(Recorder(events.clone())));

        assert!(journal.records().is_empty());
        tx.commit().unwrap();
        assert_eq!(journal.records().len(), 1);
        assert_eq!(*events.0.lock(), vec!["commit"]);
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_prepare_then_commit() {
        let (journal, events) = setup();
        let mut tx = Transaction::new(journal);
        tx.add_operation(Box::new(Recorder(events.clone())));
        tx.prepare().unwrap();
        tx.commit().unwrap();
        assert_eq!(*events.0.lock(), vec!["prepare", "commit"]);
    }

    #[test]
    fn test_rollback_discards_journal_work() {
        let (journal, events) = setup();
        let mut tx = Transaction::new(journal.clone());
        journal
            .store_transactional(tx.id(), JournalRecord::new(77, RecordKind::Message, vec![]))
            .unwrap();
        tx.set_contains_persistent();
        tx.add_operation(Box::new(Recorder(events.clone())));
        tx.rollback().unwrap();

        assert!(journal.records().is_empty());
        assert_eq!(*events.0.lock(), vec!["rollback"]);
    }

    #[test]
    fn test_rollback_only_commit_fails() {
        let (journal, events) = setup();
        let mut tx = Transaction::new(journal);
        tx.add_operation(Box::new(Recorder(events.clone())));
        tx.mark_rollback_only("duplicate");

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StorageError::TransactionRollbackOnly { .. }));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(*events.0.lock(), vec!["rollback"]);
    }

    #[test]
    fn test_double_commit_rejected() {
        let (journal, _) = setup();
        let mut tx = Transaction::new(journal);
        tx.commit().unwrap();
        assert!(matches!(
            tx.commit(),
            Err(StorageError::InvalidTransactionState { .. })
        ));
    }
}
