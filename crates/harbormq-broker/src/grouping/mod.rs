//! Message grouping: sticky group-to-queue assignment across a cluster.
//!
//! One node runs the [`LocalGroupingHandler`] (the arbiter); every other node
//! runs a [`RemoteGroupingHandler`] that asks the arbiter through `Proposal`
//! notifications and waits for the `ProposalResponse`.

pub mod local;
pub mod remote;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::notifications::Notification;

pub use local::LocalGroupingHandler;
pub use remote::RemoteGroupingHandler;

/// A request to pin a group to a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Group being pinned.
    pub group_id: String,
    /// Cluster name of the proposed binding.
    pub cluster_name: String,
}

impl Proposal {
    /// Creates a proposal.
    pub fn new(group_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            cluster_name: cluster_name.into(),
        }
    }
}

/// The arbiter's decision for a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Group decided.
    pub group_id: String,
    /// Cluster name originally proposed.
    pub original_cluster_name: String,
    /// Cluster name the group is already pinned to, when it differs.
    pub alternative_cluster_name: Option<String>,
}

impl Response {
    /// The proposal was accepted as-is.
    pub fn accepted(group_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            original_cluster_name: cluster_name.into(),
            alternative_cluster_name: None,
        }
    }

    /// The group is already pinned elsewhere.
    pub fn redirected(
        group_id: impl Into<String>,
        original: impl Into<String>,
        alternative: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            original_cluster_name: original.into(),
            alternative_cluster_name: Some(alternative.into()),
        }
    }

    /// Cluster name messages of this group must go to.
    pub fn chosen_cluster_name(&self) -> &str {
        self.alternative_cluster_name
            .as_deref()
            .unwrap_or(&self.original_cluster_name)
    }

    /// The notification announcing this decision.
    pub fn to_notification(&self) -> Notification {
        Notification::ProposalResponse {
            group_id: self.group_id.clone(),
            cluster_name: self.original_cluster_name.clone(),
            alternative_cluster_name: self.alternative_cluster_name.clone(),
        }
    }
}

/// Journal payload of a persisted group decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBindingEntry {
    /// Group.
    pub group_id: String,
    /// Cluster name it is pinned to.
    pub cluster_name: String,
}

/// Coordinates group assignment.
pub trait GroupingHandler: Send + Sync {
    /// Returns the decision for `proposal.group_id`, deciding it if needed.
    fn propose(&self, proposal: Proposal) -> Result<Response>;

    /// Records a decision and wakes anyone waiting for it.
    fn proposed(&self, response: Response) -> Result<()>;

    /// Announces a decision to the cluster.
    fn send_proposal_response(&self, response: Response) -> Result<()>;

    /// Cached decision for a group.
    fn get_proposal(&self, group_id: &str) -> Option<Response>;

    /// Forgets a group.
    fn remove_grouping(&self, group_id: &str) -> Result<()>;

    /// Reacts to cluster notifications.
    fn on_notification(&self, notification: &Notification) -> Result<()>;
}
