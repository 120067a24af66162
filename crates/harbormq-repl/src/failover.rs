//! Live liveness tracking and backup promotion.

use crate::backup::BackupReplica;
use crate::error::ReplError;
use harbormq_storage::Journal;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Failover configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Consecutive checks without a heartbeat before the live node is
    /// declared failed.
    pub failure_threshold: u32,
    /// How often [`FailoverCoordinator::check`] runs in the monitor task.
    pub check_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            check_interval_ms: 1000,
        }
    }
}

/// What the backup believes about the live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveState {
    /// No check has run yet.
    #[default]
    Unknown,
    /// Heartbeats are arriving.
    Alive,
    /// Heartbeats were missed but fewer than the threshold.
    Suspect {
        /// Consecutive checks without a heartbeat.
        missed: u32,
    },
    /// The threshold of missed heartbeats was reached.
    Failed,
    /// The live node announced a clean shutdown.
    Stopped,
}

/// Failover event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    /// A check passed without a heartbeat.
    LiveSuspect {
        /// Consecutive checks without a heartbeat.
        missed: u32,
    },
    /// Heartbeats resumed after being missed.
    LiveRecovered,
    /// The live node is considered dead.
    LiveFailed,
    /// The live node shut down cleanly.
    LiveStopped,
    /// The backup became the live node.
    BackupPromoted {
        /// Last replication frame the backup applied.
        last_seq: u64,
    },
}

/// Storage handed to the node taking over.
pub struct PromotedNode {
    /// Journal to recover the broker from.
    pub journal: Arc<dyn Journal>,
    /// Page root to reload paging from.
    pub page_root: PathBuf,
    /// Last replication frame applied before promotion.
    pub last_seq: u64,
}

impl std::fmt::Debug for PromotedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotedNode")
            .field("page_root", &self.page_root)
            .field("last_seq", &self.last_seq)
            .finish()
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    live: LiveState,
    heartbeat_since_check: bool,
    last_heartbeat: Option<u64>,
    missed: u32,
    events: Vec<FailoverEvent>,
}

/// Decides when the backup should take over.
#[derive(Debug)]
pub struct FailoverCoordinator {
    config: FailoverConfig,
    state: Mutex<CoordinatorState>,
}

impl FailoverCoordinator {
    /// Create a coordinator.
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Notes a heartbeat from the live node.
    pub fn record_heartbeat(&self, timestamp: u64) {
        let mut state = self.state.lock();
        state.heartbeat_since_check = true;
        state.last_heartbeat = Some(timestamp);
    }

    /// Notes that the live node shut down cleanly.
    pub fn record_stop(&self) {
        let mut state = self.state.lock();
        if state.live != LiveState::Stopped {
            state.live = LiveState::Stopped;
            state.events.push(FailoverEvent::LiveStopped);
            info!("live node stopped; backup may take over");
        }
    }

    /// Runs one liveness check and returns the resulting state.
    pub fn check(&self) -> LiveState {
        let mut state = self.state.lock();
        if state.live == LiveState::Stopped {
            return LiveState::Stopped;
        }

        if std::mem::take(&mut state.heartbeat_since_check) {
            if matches!(state.live, LiveState::Suspect { .. } | LiveState::Failed) {
                state.events.push(FailoverEvent::LiveRecovered);
                info!(missed = state.missed, "live heartbeats resumed");
            }
            state.missed = 0;
            state.live = LiveState::Alive;
            return state.live;
        }

        state.missed += 1;
        let missed = state.missed;
        if missed >= self.config.failure_threshold {
            if state.live != LiveState::Failed {
                state.live = LiveState::Failed;
                state.events.push(FailoverEvent::LiveFailed);
                warn!(
                    missed,
                    threshold = self.config.failure_threshold,
                    last_heartbeat = ?state.last_heartbeat,
                    "live node failed"
                );
            }
        } else {
            state.live = LiveState::Suspect { missed };
            state.events.push(FailoverEvent::LiveSuspect { missed });
        }
        state.live
    }

    /// Current belief about the live node.
    pub fn live_state(&self) -> LiveState {
        self.state.lock().live
    }

    /// True when the live node failed or stopped.
    pub fn should_promote(&self) -> bool {
        matches!(self.live_state(), LiveState::Failed | LiveState::Stopped)
    }

    /// Drains accumulated events.
    pub fn drain_events(&self) -> Vec<FailoverEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    /// Spawns a task running [`check`](Self::check) every
    /// `check_interval_ms`; it finishes with the state that warrants a
    /// takeover.
    pub fn start_monitor(self: &Arc<Self>) -> JoinHandle<LiveState> {
        let coordinator = Arc::clone(self);
        let period = Duration::from_millis(self.config.check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let state = coordinator.check();
                if matches!(state, LiveState::Failed | LiveState::Stopped) {
                    return state;
                }
            }
        })
    }

    /// Turns `replica` into the live node's storage.
    ///
    /// A replica that never completed its initial snapshot is refused.
    pub fn promote(&self, mut replica: BackupReplica) -> Result<PromotedNode, ReplError> {
        if !replica.is_synchronized() {
            return Err(ReplError::NotSynchronized);
        }
        replica.close_pages()?;
        let last_seq = replica.last_seq();
        self.state
            .lock()
            .events
            .push(FailoverEvent::BackupPromoted { last_seq });
        info!(last_seq, page_root = %replica.page_root().display(), "backup promoted to live");
        Ok(PromotedNode {
            journal: Arc::clone(replica.journal()),
            page_root: replica.page_root().to_path_buf(),
            last_seq,
        })
    }
}
