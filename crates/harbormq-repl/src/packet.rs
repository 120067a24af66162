//! Wire types exchanged between a live node and its backup.

use harbormq_storage::JournalOp;
use serde::{Deserialize, Serialize};

/// One replicated mutation or control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationPacket {
    /// A journal op, applied verbatim on the backup.
    Journal(JournalOp),
    /// One encoded page record appended to a page file.
    PageWrite {
        /// Address owning the page directory.
        address: String,
        /// Page file ID.
        page_id: u64,
        /// Encoded frame, copied byte-for-byte.
        frame: Vec<u8>,
    },
    /// A page file was deleted.
    PageDeleted {
        /// Address owning the page directory.
        address: String,
        /// Page file ID.
        page_id: u64,
    },
    /// The first-page marker of an address moved.
    FirstPage {
        /// Address owning the page directory.
        address: String,
        /// New first page.
        page_id: u64,
    },
    /// The initial snapshot is complete.
    SyncDone,
    /// Liveness signal from the live node.
    Heartbeat {
        /// Live node clock, milliseconds since the epoch.
        timestamp: u64,
    },
    /// The live node is shutting down cleanly.
    LiveStopping,
}

impl ReplicationPacket {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationPacket::Journal(_) => "journal",
            ReplicationPacket::PageWrite { .. } => "page_write",
            ReplicationPacket::PageDeleted { .. } => "page_deleted",
            ReplicationPacket::FirstPage { .. } => "first_page",
            ReplicationPacket::SyncDone => "sync_done",
            ReplicationPacket::Heartbeat { .. } => "heartbeat",
            ReplicationPacket::LiveStopping => "live_stopping",
        }
    }
}

/// A packet tagged with its position in the replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFrame {
    /// Strictly increasing, starting at 1.
    pub seq: u64,
    /// Payload.
    pub packet: ReplicationPacket,
}

impl ReplicationFrame {
    /// Creates a frame.
    pub fn new(seq: u64, packet: ReplicationPacket) -> Self {
        Self { seq, packet }
    }

    /// Encodes the frame for a byte-oriented transport.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decodes a frame produced by [`ReplicationFrame::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbormq_storage::{JournalRecord, RecordKind};

    #[test]
    fn test_frame_encoding_preserves_journal_op() {
        let op = JournalOp::AddTransactional {
            tx_id: 12,
            record: JournalRecord::new(13, RecordKind::Message, vec![1, 2, 3]),
        };
        let frame = ReplicationFrame::new(5, ReplicationPacket::Journal(op.clone()));
        let decoded = ReplicationFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.seq, 5);
        assert_eq!(decoded.packet, ReplicationPacket::Journal(op));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ReplicationFrame::decode(&[0xff]).is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ReplicationPacket::SyncDone.kind(), "sync_done");
        assert_eq!(
            ReplicationPacket::PageDeleted {
                address: "a".into(),
                page_id: 1
            }
            .kind(),
            "page_deleted"
        );
    }
}
