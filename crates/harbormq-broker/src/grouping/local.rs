//! The grouping arbiter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use harbormq_storage::{Journal, JournalRecord, RecordKind};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::grouping::{GroupBindingEntry, GroupingHandler, Proposal, Response};
use crate::message::now_millis;
use crate::notifications::{
    Notification, NotificationListener, NotificationService, NotificationType,
};

#[derive(Debug)]
struct GroupEntry {
    cluster_name: String,
    record_id: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct LocalState {
    groups: HashMap<String, GroupEntry>,
    by_cluster: HashMap<String, HashSet<String>>,
}

impl LocalState {
    fn insert(&mut self, group_id: String, entry: GroupEntry) {
        self.by_cluster
            .entry(entry.cluster_name.clone())
            .or_default()
            .insert(group_id.clone());
        self.groups.insert(group_id, entry);
    }

    fn remove(&mut self, group_id: &str) -> Option<GroupEntry> {
        let entry = self.groups.remove(group_id)?;
        if let Some(groups) = self.by_cluster.get_mut(&entry.cluster_name) {
            groups.remove(group_id);
            if groups.is_empty() {
                self.by_cluster.remove(&entry.cluster_name);
            }
        }
        Some(entry)
    }
}

/// Decides proposals first-come and persists every decision.
pub struct LocalGroupingHandler {
    name: String,
    journal: Arc<dyn Journal>,
    notifications: Arc<NotificationService>,
    group_timeout: Option<Duration>,
    state: Mutex<LocalState>,
}

impl std::fmt::Debug for LocalGroupingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroupingHandler")
            .field("name", &self.name)
            .field("groups", &self.state.lock().groups.len())
            .finish()
    }
}

impl LocalGroupingHandler {
    /// Creates the arbiter and subscribes it to proposals and binding removals.
    ///
    /// Groups unused for `group_timeout` are dropped by [`reap`](Self::reap).
    pub fn new(
        name: impl Into<String>,
        journal: Arc<dyn Journal>,
        notifications: Arc<NotificationService>,
        group_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            name: name.into(),
            journal,
            notifications: Arc::clone(&notifications),
            group_timeout,
            state: Mutex::new(LocalState::default()),
        });
        notifications.subscribe(
            &[NotificationType::Proposal, NotificationType::BindingRemoved],
            &handler,
        );
        handler
    }

    /// Handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of pinned groups.
    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Restores decisions from journal records; returns how many were loaded.
    pub fn load(&self, records: &[JournalRecord]) -> Result<usize> {
        let now = now_millis();
        let mut state = self.state.lock();
        let mut loaded = 0;
        for record in records.iter().filter(|r| r.kind == RecordKind::GroupBinding) {
            let entry: GroupBindingEntry = record.decode()?;
            state.insert(
                entry.group_id,
                GroupEntry {
                    cluster_name: entry.cluster_name,
                    record_id: record.id,
                    last_used: now,
                },
            );
            loaded += 1;
        }
        info!(handler = %self.name, groups = loaded, "grouping decisions loaded");
        Ok(loaded)
    }

    /// Drops groups idle for longer than the group timeout.
    pub fn reap(&self, now: u64) -> Result<usize> {
        let Some(timeout) = self.group_timeout else {
            return Ok(0);
        };
        let timeout_ms = timeout.as_millis() as u64;
        let expired: Vec<GroupEntry> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .groups
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.last_used) >= timeout_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| state.remove(id)).collect()
        };
        for entry in &expired {
            self.journal.delete(entry.record_id)?;
        }
        if !expired.is_empty() {
            debug!(handler = %self.name, reaped = expired.len(), "idle groups removed");
        }
        Ok(expired.len())
    }

    /// Runs [`reap`](Self::reap) every `period` until the handler is dropped.
    pub fn start_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(handler) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = handler.reap(now_millis()) {
                    warn!(handler = %handler.name, error = %e, "group reaper failed");
                }
            }
        })
    }

    fn remove_cluster(&self, cluster_name: &str) -> Result<()> {
        let removed: Vec<GroupEntry> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .by_cluster
                .get(cluster_name)
                .map(|g| g.iter().cloned().collect())
                .unwrap_or_default();
            ids.iter().filter_map(|id| state.remove(id)).collect()
        };
        for entry in &removed {
            self.journal.delete(entry.record_id)?;
        }
        if !removed.is_empty() {
            info!(
                handler = %self.name,
                cluster_name,
                groups = removed.len(),
                "groups unpinned after binding removal"
            );
        }
        Ok(())
    }
}

impl GroupingHandler for LocalGroupingHandler {
    fn propose(&self, proposal: Proposal) -> Result<Response> {
        let now = now_millis();
        let mut state = self.state.lock();
        if let Some(entry) = state.groups.get_mut(&proposal.group_id) {
            entry.last_used = now;
            if entry.cluster_name == proposal.cluster_name {
                return Ok(Response::accepted(proposal.group_id, proposal.cluster_name));
            }
            let alternative = entry.cluster_name.clone();
            return Ok(Response::redirected(
                proposal.group_id,
                proposal.cluster_name,
                alternative,
            ));
        }

        let record_id = self.journal.generate_unique_id();
        let entry = GroupBindingEntry {
            group_id: proposal.group_id.clone(),
            cluster_name: proposal.cluster_name.clone(),
        };
        self.journal
            .store(JournalRecord::encode(record_id, RecordKind::GroupBinding, &entry)?)?;
        state.insert(
            proposal.group_id.clone(),
            GroupEntry {
                cluster_name: proposal.cluster_name.clone(),
                record_id,
                last_used: now,
            },
        );
        debug!(
            handler = %self.name,
            group_id = %proposal.group_id,
            cluster_name = %proposal.cluster_name,
            "group pinned"
        );
        Ok(Response::accepted(proposal.group_id, proposal.cluster_name))
    }

    fn proposed(&self, _response: Response) -> Result<()> {
        // the arbiter makes decisions, it does not adopt them
        Ok(())
    }

    fn send_proposal_response(&self, response: Response) -> Result<()> {
        self.notifications.send(response.to_notification());
        Ok(())
    }

    fn get_proposal(&self, group_id: &str) -> Option<Response> {
        let mut state = self.state.lock();
        let entry = state.groups.get_mut(group_id)?;
        entry.last_used = now_millis();
        Some(Response::accepted(group_id, entry.cluster_name.clone()))
    }

    fn remove_grouping(&self, group_id: &str) -> Result<()> {
        let removed = self.state.lock().remove(group_id);
        if let Some(entry) = removed {
            self.journal.delete(entry.record_id)?;
        }
        Ok(())
    }

    fn on_notification(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::Proposal {
                group_id,
                cluster_name,
            } => {
                let response = self.propose(Proposal::new(group_id.clone(), cluster_name.clone()))?;
                self.send_proposal_response(response)
            }
            Notification::BindingRemoved { cluster_name, .. } => self.remove_cluster(cluster_name),
            _ => Ok(()),
        }
    }
}

impl NotificationListener for LocalGroupingHandler {
    fn on_notification(&self, notification: &Notification) {
        if let Err(e) = GroupingHandler::on_notification(self, notification) {
            warn!(handler = %self.name, error = %e, ?notification, "grouping notification failed");
        }
    }
}
