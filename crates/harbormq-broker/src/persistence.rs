//! Durable message records and per-queue acknowledgements.
//!
//! A durable message routed to durable queues is journaled once, listing the
//! queues that hold it. Each queue acknowledgement that leaves other durable
//! holders is journaled as an `Acknowledgement` record; the last one deletes
//! the message record together with the earlier acknowledgements.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use harbormq_storage::{Journal, JournalRecord, RecordKind, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::message::Message;

/// Journal payload of a stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The message.
    pub message: Message,
    /// Durable queues it was routed to.
    pub queue_ids: Vec<u64>,
}

/// Journal payload of one queue's acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEntry {
    /// Acknowledged message.
    pub message_id: u64,
    /// Acknowledging queue.
    pub queue_id: u64,
}

/// A message recovered from the journal with the queues still holding it.
#[derive(Debug, Clone)]
pub struct RecoveredMessage {
    /// The message.
    pub message: Message,
    /// Queues that have not acknowledged it.
    pub queue_ids: Vec<u64>,
}

/// Journals messages and acknowledgements.
pub struct MessagePersistence {
    journal: Arc<dyn Journal>,
    acks: DashMap<u64, Vec<u64>>,
}

impl std::fmt::Debug for MessagePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePersistence")
            .field("messages_with_acks", &self.acks.len())
            .finish()
    }
}

impl MessagePersistence {
    /// Creates the store over `journal`.
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            journal,
            acks: DashMap::new(),
        }
    }

    /// The underlying journal.
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Journals `message` for `queue_ids`, inside `tx` when given.
    pub fn store_message(
        &self,
        message: &Message,
        queue_ids: &[u64],
        tx: Option<&mut Transaction>,
    ) -> Result<()> {
        let stored = StoredMessage {
            message: message.clone(),
            queue_ids: queue_ids.to_vec(),
        };
        let record = JournalRecord::encode(message.message_id, RecordKind::Message, &stored)?;
        match tx {
            Some(tx) => {
                self.journal.store_transactional(tx.id(), record)?;
                tx.set_contains_persistent();
            }
            None => self.journal.store(record)?,
        }
        Ok(())
    }

    /// Records that `queue_id` is done with the message.
    ///
    /// `remaining_durable` is the number of durable queues still holding it.
    pub fn acknowledge(&self, message_id: u64, queue_id: u64, remaining_durable: u32) -> Result<()> {
        let mut acks = self.acks.entry(message_id).or_default();
        if remaining_durable > 0 {
            let record_id = self.journal.generate_unique_id();
            let ack = AckEntry {
                message_id,
                queue_id,
            };
            self.journal
                .store(JournalRecord::encode(record_id, RecordKind::Acknowledgement, &ack)?)?;
            acks.push(record_id);
            return Ok(());
        }

        let ack_records = std::mem::take(&mut *acks);
        drop(acks);
        self.acks.remove(&message_id);
        self.journal.delete(message_id)?;
        for record_id in ack_records {
            self.journal.delete(record_id)?;
        }
        debug!(message_id, "message record deleted");
        Ok(())
    }

    /// Rebuilds messages from journal records.
    ///
    /// Acknowledgements whose message is gone are deleted.
    pub fn recover(&self, records: &[JournalRecord]) -> Result<Vec<RecoveredMessage>> {
        let mut messages: Vec<StoredMessage> = Vec::new();
        let mut acked: HashMap<u64, Vec<(u64, u64)>> = HashMap::new();
        for record in records {
            match record.kind {
                RecordKind::Message => messages.push(record.decode()?),
                RecordKind::Acknowledgement => {
                    let ack: AckEntry = record.decode()?;
                    acked
                        .entry(ack.message_id)
                        .or_default()
                        .push((ack.queue_id, record.id));
                }
                _ => {}
            }
        }

        let live: HashSet<u64> = messages.iter().map(|m| m.message.message_id).collect();
        for (message_id, entries) in &acked {
            if !live.contains(message_id) {
                for (_, record_id) in entries {
                    warn!(message_id, record_id, "deleting acknowledgement of missing message");
                    self.journal.delete(*record_id)?;
                }
            }
        }

        let mut recovered = Vec::with_capacity(messages.len());
        for stored in messages {
            let id = stored.message.message_id;
            let entries = acked.remove(&id).unwrap_or_default();
            let done: HashSet<u64> = entries.iter().map(|(q, _)| *q).collect();
            if !entries.is_empty() {
                self.acks
                    .insert(id, entries.iter().map(|(_, r)| *r).collect());
            }
            recovered.push(RecoveredMessage {
                message: stored.message,
                queue_ids: stored
                    .queue_ids
                    .into_iter()
                    .filter(|q| !done.contains(q))
                    .collect(),
            });
        }
        info!(messages = recovered.len(), "journaled messages recovered");
        Ok(recovered)
    }
}
