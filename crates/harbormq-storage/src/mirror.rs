//! Hook through which journal and page mutations are mirrored to a backup.

use crate::journal::JournalOp;

/// Receives every durable mutation in the order it was applied locally.
///
/// Implementations are invoked while the originating journal or page store
/// still holds its write lock, so they must not block on I/O; queue the
/// mutation and return.
pub trait ReplicationMirror: Send + Sync {
    /// A journal operation was appended.
    fn journal_op(&self, op: &JournalOp);

    /// An encoded page frame was appended to `page_id` of `address`.
    fn page_write(&self, address: &str, page_id: u64, frame: &[u8]);

    /// A page file was deleted.
    fn page_deleted(&self, address: &str, page_id: u64);

    /// The first usable page marker of `address` moved to `page_id`.
    fn first_page(&self, address: &str, page_id: u64);
}
