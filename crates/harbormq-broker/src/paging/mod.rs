//! Paging: spilling address backlogs to disk and reading them back.
//!
//! A [`PagingStore`] per address tracks the address memory estimate and,
//! once it passes the configured maximum, appends further messages to page
//! files instead of delivering them. Depaging reads sealed pages back into
//! the queues; the [`PageCursor`] journals what each queue acknowledged and
//! deletes a page file only after a durable completion record exists.

pub mod cursor;
pub mod manager;
pub mod store;

pub use cursor::{
    CursorAckEntry, PageCompletedEntry, PageCursor, PageDelivery, PagePosition,
    PageTransactionEntry, PagedOrigin,
};
pub use manager::{GlobalSize, PagingManager, PagingManagerConfig};
pub use store::{PageOutcome, PagingStore};
