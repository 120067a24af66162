//! Live side of replication.
//!
//! [`LiveReplicator`] is installed as the storage mirror of the live node. Every
//! journal op and page mutation becomes one frame; the sequence counter is
//! advanced and the frame queued under a single lock, so the backup sees
//! mutations in exactly the order the live storage applied them.

use crate::conduit::Conduit;
use crate::error::ReplError;
use crate::packet::{ReplicationFrame, ReplicationPacket};
use harbormq_storage::{Journal, JournalOp, PageDirectory, ReplicationMirror};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counts of what an initial synchronization sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Live journal records.
    pub records: u64,
    /// Page files.
    pub pages: u64,
    /// Page records across every page file.
    pub page_records: u64,
}

/// Streams the live node's storage mutations to a backup.
pub struct LiveReplicator {
    conduit: Conduit,
    seq: Mutex<u64>,
    failed: AtomicBool,
    dropped: AtomicU64,
}

impl std::fmt::Debug for LiveReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveReplicator")
            .field("seq", &*self.seq.lock())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl LiveReplicator {
    /// Creates a replicator sending on `conduit`.
    pub fn new(conduit: Conduit) -> Self {
        Self {
            conduit,
            seq: Mutex::new(0),
            failed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Sequence number of the last frame sent.
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock()
    }

    /// True once a send failed; the backup can no longer be trusted.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Mirror calls lost after the conduit failed.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Sends one packet as the next frame; returns its sequence number.
    pub fn send(&self, packet: ReplicationPacket) -> Result<u64, ReplError> {
        let mut seq = self.seq.lock();
        let next = *seq + 1;
        let kind = packet.kind();
        self.conduit.send_frame(ReplicationFrame::new(next, packet))?;
        *seq = next;
        debug!(seq = next, kind, "replication frame sent");
        Ok(next)
    }

    fn forward(&self, packet: ReplicationPacket) {
        if let Err(e) = self.send(packet) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.failed.swap(true, Ordering::AcqRel) {
                warn!(error = %e, "replication failed; backup is out of sync");
            }
        }
    }

    /// Sends a full copy of the live storage followed by `SyncDone`.
    ///
    /// Must run before the live node starts mutating storage; ops mirrored
    /// while the snapshot is taken would reach the backup twice.
    pub fn synchronize(
        &self,
        journal: &dyn Journal,
        page_root: &Path,
    ) -> Result<SyncSummary, ReplError> {
        let mut summary = SyncSummary::default();
        for record in journal.records() {
            self.send(ReplicationPacket::Journal(JournalOp::Add(record)))?;
            summary.records += 1;
        }

        for directory in PageDirectory::scan(page_root)? {
            let address = directory.address().to_string();
            if let Some(first) = directory.read_first_page()? {
                self.send(ReplicationPacket::FirstPage {
                    address: address.clone(),
                    page_id: first,
                })?;
            }
            for page_id in directory.page_ids()? {
                for record in directory.page(page_id).read()? {
                    self.send(ReplicationPacket::PageWrite {
                        address: address.clone(),
                        page_id,
                        frame: record.to_frame()?,
                    })?;
                    summary.page_records += 1;
                }
                summary.pages += 1;
            }
        }

        self.send(ReplicationPacket::SyncDone)?;
        info!(
            records = summary.records,
            pages = summary.pages,
            page_records = summary.page_records,
            "backup synchronized"
        );
        Ok(summary)
    }

    /// Sends one heartbeat stamped with the wall clock.
    pub fn heartbeat(&self) -> Result<u64, ReplError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.send(ReplicationPacket::Heartbeat { timestamp })
    }

    /// Spawns a task sending a heartbeat every `interval` until the conduit
    /// fails.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let replicator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = replicator.heartbeat() {
                    debug!(error = %e, "heartbeat task stopping");
                    break;
                }
            }
        })
    }

    /// Tells the backup the live node is going away cleanly and closes the
    /// conduit.
    pub fn stop(&self) -> Result<(), ReplError> {
        let result = self.send(ReplicationPacket::LiveStopping).map(|_| ());
        self.conduit.shutdown();
        info!(last_seq = self.last_seq(), "live replication stopped");
        result
    }
}

impl ReplicationMirror for LiveReplicator {
    fn journal_op(&self, op: &JournalOp) {
        self.forward(ReplicationPacket::Journal(op.clone()));
    }

    fn page_write(&self, address: &str, page_id: u64, frame: &[u8]) {
        self.forward(ReplicationPacket::PageWrite {
            address: address.to_string(),
            page_id,
            frame: frame.to_vec(),
        });
    }

    fn page_deleted(&self, address: &str, page_id: u64) {
        self.forward(ReplicationPacket::PageDeleted {
            address: address.to_string(),
            page_id,
        });
    }

    fn first_page(&self, address: &str, page_id: u64) {
        self.forward(ReplicationPacket::FirstPage {
            address: address.to_string(),
            page_id,
        });
    }
}
