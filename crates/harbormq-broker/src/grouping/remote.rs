//! Grouping on a node that is not the arbiter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::grouping::{GroupingHandler, Proposal, Response};
use crate::notifications::{
    Notification, NotificationListener, NotificationService, NotificationType,
};

#[derive(Debug, Default)]
struct RemoteState {
    responses: HashMap<String, Response>,
    by_cluster: HashMap<String, HashSet<String>>,
}

impl RemoteState {
    fn remove(&mut self, group_id: &str) -> Option<Response> {
        let response = self.responses.remove(group_id)?;
        let cluster = response.chosen_cluster_name();
        if let Some(groups) = self.by_cluster.get_mut(cluster) {
            groups.remove(group_id);
            if groups.is_empty() {
                self.by_cluster.remove(cluster);
            }
        }
        Some(response)
    }
}

/// Broadcasts proposals and waits, bounded by a timeout, for the arbiter.
pub struct RemoteGroupingHandler {
    name: String,
    notifications: Arc<NotificationService>,
    timeout: Duration,
    state: Mutex<RemoteState>,
    arrived: Condvar,
}

impl std::fmt::Debug for RemoteGroupingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGroupingHandler")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteGroupingHandler {
    /// Creates the handler and subscribes it to responses and binding removals.
    pub fn new(
        name: impl Into<String>,
        notifications: Arc<NotificationService>,
        timeout: Duration,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            name: name.into(),
            notifications: Arc::clone(&notifications),
            timeout,
            state: Mutex::new(RemoteState::default()),
            arrived: Condvar::new(),
        });
        notifications.subscribe(
            &[
                NotificationType::ProposalResponse,
                NotificationType::BindingRemoved,
            ],
            &handler,
        );
        handler
    }

    /// Number of cached decisions.
    pub fn cached(&self) -> usize {
        self.state.lock().responses.len()
    }
}

impl GroupingHandler for RemoteGroupingHandler {
    fn propose(&self, proposal: Proposal) -> Result<Response> {
        if let Some(response) = self.state.lock().responses.get(&proposal.group_id) {
            return Ok(response.clone());
        }

        let group_id = proposal.group_id.clone();
        // no lock held: the arbiter may answer on this thread
        self.notifications.send(Notification::Proposal {
            group_id: proposal.group_id,
            cluster_name: proposal.cluster_name,
        });

        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(response) = state.responses.get(&group_id) {
                return Ok(response.clone());
            }
            if self.arrived.wait_until(&mut state, deadline).timed_out() {
                if let Some(response) = state.responses.get(&group_id) {
                    return Ok(response.clone());
                }
                warn!(handler = %self.name, %group_id, timeout = ?self.timeout, "no grouping response");
                return Err(BrokerError::GroupingTimeout {
                    group_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        }
    }

    fn proposed(&self, response: Response) -> Result<()> {
        let mut state = self.state.lock();
        state.remove(&response.group_id);
        state
            .by_cluster
            .entry(response.chosen_cluster_name().to_string())
            .or_default()
            .insert(response.group_id.clone());
        debug!(
            handler = %self.name,
            group_id = %response.group_id,
            cluster_name = response.chosen_cluster_name(),
            "grouping response received"
        );
        state.responses.insert(response.group_id.clone(), response);
        self.arrived.notify_all();
        Ok(())
    }

    fn send_proposal_response(&self, response: Response) -> Result<()> {
        self.notifications.send(response.to_notification());
        Ok(())
    }

    fn get_proposal(&self, group_id: &str) -> Option<Response> {
        self.state.lock().responses.get(group_id).cloned()
    }

    fn remove_grouping(&self, group_id: &str) -> Result<()> {
        self.state.lock().remove(group_id);
        Ok(())
    }

    fn on_notification(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::ProposalResponse {
                group_id,
                cluster_name,
                alternative_cluster_name,
            } => self.proposed(Response {
                group_id: group_id.clone(),
                original_cluster_name: cluster_name.clone(),
                alternative_cluster_name: alternative_cluster_name.clone(),
            }),
            Notification::BindingRemoved { cluster_name, .. } => {
                let mut state = self.state.lock();
                let groups: Vec<String> = state
                    .by_cluster
                    .get(cluster_name)
                    .map(|g| g.iter().cloned().collect())
                    .unwrap_or_default();
                for group_id in &groups {
                    state.remove(group_id);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl NotificationListener for RemoteGroupingHandler {
    fn on_notification(&self, notification: &Notification) {
        if let Err(e) = GroupingHandler::on_notification(self, notification) {
            warn!(handler = %self.name, error = %e, "grouping notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::LocalGroupingHandler;
    use harbormq_storage::InMemoryJournal;

    #[test]
    fn test_propose_times_out_without_arbiter() {
        let notifications = Arc::new(NotificationService::new());
        let handler =
            RemoteGroupingHandler::new("node-b", notifications, Duration::from_millis(500));

        let started = Instant::now();
        let err = handler.propose(Proposal::new("G1", "q1")).unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            BrokerError::GroupingTimeout { ref group_id, timeout_ms: 500 } if group_id == "G1"
        ));
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(2_000));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_arbiter_on_same_bus_answers() {
        let notifications = Arc::new(NotificationService::new());
        let journal = Arc::new(InMemoryJournal::new());
        let _arbiter = LocalGroupingHandler::new("node-a", journal, notifications.clone(), None);
        let remote = RemoteGroupingHandler::new("node-b", notifications, Duration::from_secs(5));

        let response = remote.propose(Proposal::new("G1", "q1")).unwrap();
        assert_eq!(response.chosen_cluster_name(), "q1");
        let again = remote.propose(Proposal::new("G1", "q2")).unwrap();
        assert_eq!(again.chosen_cluster_name(), "q1");
        assert_eq!(remote.cached(), 1);
    }

    #[test]
    fn test_response_from_another_thread_wakes_waiter() {
        let notifications = Arc::new(NotificationService::new());
        let handler =
            RemoteGroupingHandler::new("node-b", notifications.clone(), Duration::from_secs(5));

        let responder = {
            let notifications = notifications.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                notifications.send(Response::accepted("G1", "q7").to_notification());
            })
        };
        let response = handler.propose(Proposal::new("G1", "q1")).unwrap();
        assert_eq!(response.chosen_cluster_name(), "q7");
        responder.join().unwrap();
    }

    #[test]
    fn test_binding_removed_evicts_forward_and_reverse() {
        let notifications = Arc::new(NotificationService::new());
        let handler =
            RemoteGroupingHandler::new("node-b", notifications.clone(), Duration::from_secs(1));
        handler.proposed(Response::accepted("G1", "q1")).unwrap();
        handler.proposed(Response::redirected("G2", "q9", "q1")).unwrap();
        handler.proposed(Response::accepted("G3", "q2")).unwrap();

        notifications.send(Notification::BindingRemoved {
            address: "a".to_string(),
            cluster_name: "q1".to_string(),
            binding_id: 4,
        });
        assert!(handler.get_proposal("G1").is_none());
        assert!(handler.get_proposal("G2").is_none());
        assert!(handler.get_proposal("G3").is_some());
        assert!(!handler.state.lock().by_cluster.contains_key("q1"));
    }
}
