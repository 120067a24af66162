//! Common fixtures for broker integration tests.

#![allow(dead_code)]

use harbormq_broker::config::{AddressSettings, DuplicateCacheSettings};
use harbormq_broker::executor::DirectExecutor;
use harbormq_broker::notifications::NotificationService;
use harbormq_broker::paging::PagingManagerConfig;
use harbormq_broker::{Message, PostOffice};
use harbormq_storage::{FileJournal, FileJournalConfig, Journal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One broker node's storage opened from a data directory.
pub struct Node {
    pub journal: Arc<FileJournal>,
    pub post_office: PostOffice,
    pub paging_root: PathBuf,
}

impl Node {
    /// Opens (or reopens) the node under `data_dir` and runs recovery.
    pub fn open(data_dir: &Path, settings: AddressSettings) -> Self {
        let journal =
            Arc::new(FileJournal::open(FileJournalConfig::new(data_dir.join("journal.hmq"))).unwrap());
        let paging_root = data_dir.join("paging");
        let post_office = PostOffice::new(
            journal.clone(),
            Arc::new(DirectExecutor),
            PagingManagerConfig {
                root: paging_root.clone(),
                global_max_size: -1,
                default_settings: settings,
                overrides: Default::default(),
            },
            DuplicateCacheSettings::default(),
            Arc::new(NotificationService::new()),
            true,
        );
        post_office.recover(&journal.records()).unwrap();
        Self {
            journal,
            post_office,
            paging_root,
        }
    }
}

/// Address settings that page everything beyond a small budget.
pub fn small_budget() -> AddressSettings {
    AddressSettings {
        max_size_bytes: 1,
        page_size_bytes: 512,
        ..AddressSettings::default()
    }
}

/// A durable message whose body names it.
pub fn durable(address: &str, tag: &str) -> Message {
    Message::new(address, tag.to_string()).with_durable(true)
}

/// Drains `queue` through one consumer, acknowledging as it goes; returns the
/// bodies in delivery order.
pub fn consume_all(node: &Node, queue: &str) -> Vec<String> {
    let q = node.post_office.queues().get_by_name(queue).unwrap();
    let consumer = q.add_consumer();
    let mut bodies = Vec::new();
    while let Some(reference) = q.poll(consumer).unwrap() {
        bodies.push(String::from_utf8(reference.message.body().to_vec()).unwrap());
        node.post_office
            .acknowledge(queue, reference.message_id())
            .unwrap();
    }
    bodies
}
