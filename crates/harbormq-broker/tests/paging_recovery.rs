//! Restart behaviour of paged addresses, including restarts that interrupt
//! the delete sequence of a consumed page.

mod common;

use common::{consume_all, durable, small_budget, Node};
use harbormq_broker::paging::{CursorAckEntry, PageCompletedEntry};
use harbormq_broker::{AddressSettings, Message, QueueConfig, RoutingStatus};
use harbormq_storage::{
    Journal, JournalRecord, PageDirectory, PageRecord, RecordKind, StorageError, StorageResult,
    Transaction, TransactionOperation,
};

fn write_paged(directory: &PageDirectory, page_id: u64, queue_id: u64, tags: &[&str]) {
    let mut page = directory.page(page_id);
    page.open().unwrap();
    for (i, tag) in tags.iter().enumerate() {
        let mut message = Message::new("orders", tag.to_string()).with_durable(true);
        message.message_id = 10_000 + page_id * 100 + i as u64;
        page.write(&PageRecord {
            message_id: message.message_id,
            address: "orders".to_string(),
            queue_ids: vec![queue_id],
            tx_id: None,
            body: bincode::serialize(&message).unwrap(),
        })
        .unwrap();
    }
    page.close().unwrap();
}

fn store_ack(node: &Node, page_id: u64, index: u32, queue_id: u64) {
    let entry = CursorAckEntry {
        address: "orders".to_string(),
        page_id,
        index,
        queue_id,
    };
    let id = node.journal.generate_unique_id();
    node.journal
        .store(JournalRecord::encode(id, RecordKind::PageCursorAck, &entry).unwrap())
        .unwrap();
}

fn record_kinds(node: &Node) -> Vec<RecordKind> {
    node.journal.records().iter().map(|r| r.kind).collect()
}

/// Creates the durable queue and an "orders" page directory holding one page
/// of two messages; returns the queue ID.
fn seed(data_dir: &std::path::Path) -> (u64, PageDirectory) {
    let node = Node::open(data_dir, AddressSettings::default());
    let queue = node
        .post_office
        .create_queue(QueueConfig::new("q", "orders"))
        .unwrap();
    let directory = PageDirectory::create(&node.paging_root, "orders").unwrap();
    directory.write_first_page(1).unwrap();
    write_paged(&directory, 1, queue.id(), &["p0", "p1"]);
    (queue.id(), directory)
}

#[test]
fn test_paged_messages_survive_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = Node::open(dir.path(), small_budget());
        node.post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        for i in 0..6 {
            let status = node
                .post_office
                .route(durable("orders", &format!("m{i}")), None)
                .unwrap();
            assert_eq!(status, RoutingStatus::Ok);
        }
        let store = node.post_office.paging().store("orders").unwrap();
        assert!(store.is_paging());
    }

    let node = Node::open(dir.path(), small_budget());
    let bodies = consume_all(&node, "q");
    assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4", "m5"]);
    assert_eq!(record_kinds(&node), vec![RecordKind::QueueBinding]);

    let directory = PageDirectory::find_or_create(&node.paging_root, "orders").unwrap();
    assert!(directory.page_ids().unwrap().is_empty());
}

#[test]
fn test_restart_after_all_acks_without_completion_record() {
    let dir = tempfile::tempdir().unwrap();
    let (queue_id, directory) = seed(dir.path());
    {
        // every ack reached the journal, the completion record did not
        let node = Node::open(dir.path(), AddressSettings::default());
        store_ack(&node, 1, 0, queue_id);
        store_ack(&node, 1, 1, queue_id);
    }
    assert!(directory.page(1).exists());

    let node = Node::open(dir.path(), AddressSettings::default());
    assert!(consume_all(&node, "q").is_empty());
    assert!(!directory.page(1).exists());
    assert_eq!(record_kinds(&node), vec![RecordKind::QueueBinding]);
}

#[test]
fn test_restart_after_completion_record_before_file_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (queue_id, directory) = seed(dir.path());
    {
        let node = Node::open(dir.path(), AddressSettings::default());
        store_ack(&node, 1, 0, queue_id);
        store_ack(&node, 1, 1, queue_id);
        let entry = PageCompletedEntry {
            address: "orders".to_string(),
            page_id: 1,
        };
        let id = node.journal.generate_unique_id();
        node.journal
            .store(JournalRecord::encode(id, RecordKind::PageCompleted, &entry).unwrap())
            .unwrap();
    }

    let node = Node::open(dir.path(), AddressSettings::default());
    assert!(consume_all(&node, "q").is_empty());
    assert!(!directory.page(1).exists());
    assert_eq!(directory.read_first_page().unwrap(), Some(2));
    assert_eq!(record_kinds(&node), vec![RecordKind::QueueBinding]);
}

#[test]
fn test_restart_redelivers_only_unacknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let (queue_id, directory) = seed(dir.path());
    {
        let node = Node::open(dir.path(), AddressSettings::default());
        store_ack(&node, 1, 0, queue_id);
    }

    let node = Node::open(dir.path(), AddressSettings::default());
    assert_eq!(consume_all(&node, "q"), vec!["p1"]);
    assert!(!directory.page(1).exists());
    assert_eq!(record_kinds(&node), vec![RecordKind::QueueBinding]);
}

#[test]
fn test_pages_below_first_page_marker_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let (queue_id, directory) = seed(dir.path());
    write_paged(&directory, 2, queue_id, &["p2"]);
    directory.write_first_page(2).unwrap();

    let node = Node::open(dir.path(), AddressSettings::default());
    assert_eq!(consume_all(&node, "q"), vec!["p2"]);
    assert!(!directory.page(1).exists());
}

struct FailingWrite;

impl TransactionOperation for FailingWrite {
    fn before_commit(&mut self, _tx_id: u64) -> StorageResult<()> {
        Err(StorageError::IoError(std::io::Error::other("disk gone")))
    }
}

#[test]
fn test_uncommitted_paged_transaction_discarded_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = Node::open(dir.path(), small_budget());
        node.post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        node.post_office
            .route(durable("orders", "m0"), None)
            .unwrap();

        // page records written, then the process dies before the journal commit
        let mut tx = Transaction::new(node.journal.clone());
        for tag in ["t0", "t1"] {
            let status = node
                .post_office
                .route(durable("orders", tag), Some(&mut tx))
                .unwrap();
            assert_eq!(status, RoutingStatus::Ok);
        }
        tx.add_operation(Box::new(FailingWrite));
        assert!(tx.commit().is_err());

        node.post_office
            .route(durable("orders", "m1"), None)
            .unwrap();
    }

    let node = Node::open(dir.path(), small_budget());
    assert_eq!(consume_all(&node, "q"), vec!["m0", "m1"]);
    assert_eq!(record_kinds(&node), vec![RecordKind::QueueBinding]);
}

#[test]
fn test_committed_paged_transaction_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = Node::open(dir.path(), small_budget());
        node.post_office
            .create_queue(QueueConfig::new("q", "orders"))
            .unwrap();
        node.post_office
            .route(durable("orders", "m0"), None)
            .unwrap();
        let mut tx = Transaction::new(node.journal.clone());
        node.post_office
            .route(durable("orders", "t0"), Some(&mut tx))
            .unwrap();
        tx.commit().unwrap();
    }

    let node = Node::open(dir.path(), small_budget());
    assert_eq!(consume_all(&node, "q"), vec!["m0", "t0"]);
    assert_eq!(record_kinds(&node), vec![RecordKind::QueueBinding]);
}
