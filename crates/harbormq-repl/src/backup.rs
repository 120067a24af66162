//! Backup side of replication.
//!
//! A [`BackupReplica`] owns a journal and a page root of its own and applies
//! frames from the live node strictly in sequence. Journal ops are applied
//! verbatim and page frames are appended byte-for-byte, so a promoted backup
//! recovers exactly what the live node had durably written.

use crate::conduit::Conduit;
use crate::error::ReplError;
use crate::failover::FailoverCoordinator;
use crate::packet::{ReplicationFrame, ReplicationPacket};
use harbormq_storage::{Journal, Page, PageDirectory};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage replica fed by a live node.
pub struct BackupReplica {
    journal: Arc<dyn Journal>,
    page_root: PathBuf,
    last_seq: u64,
    synchronized: bool,
    live_stopped: bool,
    last_heartbeat: Option<u64>,
    directories: HashMap<String, PageDirectory>,
    open_pages: HashMap<(String, u64), Page>,
}

impl std::fmt::Debug for BackupReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupReplica")
            .field("page_root", &self.page_root)
            .field("last_seq", &self.last_seq)
            .field("synchronized", &self.synchronized)
            .field("live_stopped", &self.live_stopped)
            .finish()
    }
}

impl BackupReplica {
    /// Creates a replica writing into `journal` and `page_root`.
    pub fn new(journal: Arc<dyn Journal>, page_root: impl Into<PathBuf>) -> Self {
        Self {
            journal,
            page_root: page_root.into(),
            last_seq: 0,
            synchronized: false,
            live_stopped: false,
            last_heartbeat: None,
            directories: HashMap::new(),
            open_pages: HashMap::new(),
        }
    }

    /// The replica journal.
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Root of the replica page directories.
    pub fn page_root(&self) -> &Path {
        &self.page_root
    }

    /// Sequence number of the last applied frame.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// True once the initial snapshot has been fully applied.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// True once the live node announced a clean shutdown.
    pub fn live_stopped(&self) -> bool {
        self.live_stopped
    }

    /// Timestamp of the last heartbeat received.
    pub fn last_heartbeat(&self) -> Option<u64> {
        self.last_heartbeat
    }

    /// Applies one frame. Frames must arrive with consecutive sequence
    /// numbers; anything else is refused and leaves the replica untouched.
    pub fn apply(&mut self, frame: ReplicationFrame) -> Result<(), ReplError> {
        let expected = self.last_seq + 1;
        if frame.seq != expected {
            return Err(ReplError::OutOfOrder {
                expected,
                got: frame.seq,
            });
        }

        let kind = frame.packet.kind();
        match frame.packet {
            ReplicationPacket::Journal(op) => self.journal.apply(op)?,
            ReplicationPacket::PageWrite {
                address,
                page_id,
                frame: bytes,
            } => self.write_page(address, page_id, &bytes)?,
            ReplicationPacket::PageDeleted { address, page_id } => {
                self.open_pages.remove(&(address.clone(), page_id));
                let deleted = self.directory(&address)?.delete_page(page_id)?;
                if !deleted {
                    warn!(address = %address, page_id, "replicated delete of a missing page");
                }
            }
            ReplicationPacket::FirstPage { address, page_id } => {
                self.directory(&address)?.write_first_page(page_id)?;
            }
            ReplicationPacket::SyncDone => {
                self.synchronized = true;
                info!(seq = frame.seq, "backup synchronized with live");
            }
            ReplicationPacket::Heartbeat { timestamp } => {
                self.last_heartbeat = Some(timestamp);
            }
            ReplicationPacket::LiveStopping => {
                self.live_stopped = true;
                info!(seq = frame.seq, "live node announced shutdown");
            }
        }

        self.last_seq = frame.seq;
        debug!(seq = frame.seq, kind, "replication frame applied");
        Ok(())
    }

    fn directory(&mut self, address: &str) -> Result<&PageDirectory, ReplError> {
        match self.directories.entry(address.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(PageDirectory::find_or_create(
                &self.page_root,
                address,
            )?)),
        }
    }

    fn write_page(&mut self, address: String, page_id: u64, bytes: &[u8]) -> Result<(), ReplError> {
        let key = (address, page_id);
        if !self.open_pages.contains_key(&key) {
            let mut page = self.directory(&key.0)?.page(page_id);
            page.open()?;
            self.open_pages.insert(key.clone(), page);
        }
        if let Some(page) = self.open_pages.get_mut(&key) {
            page.write_frame(bytes)?;
        }
        Ok(())
    }

    /// Syncs and closes every page file the replica is writing.
    pub fn close_pages(&mut self) -> Result<(), ReplError> {
        for (_, mut page) in self.open_pages.drain() {
            page.close()?;
        }
        Ok(())
    }

    /// Applies frames from `conduit` until the live node stops or the
    /// conduit closes, reporting heartbeats to `coordinator`.
    ///
    /// Returns the replica so it can be promoted.
    pub async fn run(
        mut self,
        conduit: Conduit,
        coordinator: Arc<FailoverCoordinator>,
    ) -> Result<Self, ReplError> {
        while let Some(frame) = conduit.recv_frame().await {
            if let ReplicationPacket::Heartbeat { timestamp } = frame.packet {
                coordinator.record_heartbeat(timestamp);
            }
            self.apply(frame)?;
            if self.live_stopped {
                coordinator.record_stop();
                break;
            }
        }
        self.close_pages()?;
        info!(last_seq = self.last_seq, "backup replication ended");
        Ok(self)
    }
}
