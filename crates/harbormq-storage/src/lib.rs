#![warn(missing_docs)]

//! HarborMQ storage subsystem: append-only journal, transactions, page files
//!
//! This crate provides the durable layer underneath the broker. The journal
//! records messages, duplicate ids, grouping decisions and page cursor
//! bookmarks; page files hold the backlog of addresses that exceeded their
//! memory budget. Every mutation can be mirrored to a backup node.

pub mod error;
pub mod frame;
pub mod journal;
pub mod mirror;
pub mod page;
pub mod transaction;

pub use error::{StorageError, StorageResult};
pub use journal::{
    FileJournal, FileJournalConfig, FileJournalStats, InMemoryJournal, Journal, JournalOp,
    JournalRecord, RecordKind,
};
pub use mirror::ReplicationMirror;
pub use page::{Page, PageDirectory, PageRecord, PAGE_HEADER_LEN, PAGE_MAGIC, PAGE_VERSION};
pub use transaction::{Transaction, TransactionOperation, TransactionState};
