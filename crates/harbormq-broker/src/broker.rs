//! Broker lifecycle: opens storage, wires the post office and its background
//! tasks, and optionally mirrors everything to an in-process backup.

use std::sync::Arc;
use std::time::Duration;

use harbormq_repl::{
    BackupReplica, Conduit, FailoverConfig, FailoverCoordinator, LiveReplicator, ReplError,
};
use harbormq_storage::{FileJournal, FileJournalConfig, Journal, ReplicationMirror, Transaction};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BrokerConfig, GroupingMode};
use crate::error::Result;
use crate::executor::{DirectExecutor, Executor, TokioExecutor};
use crate::grouping::{GroupingHandler, LocalGroupingHandler, RemoteGroupingHandler};
use crate::message::{now_millis, Message};
use crate::notifications::NotificationService;
use crate::paging::PagingManagerConfig;
use crate::post_office::{PostOffice, RoutingStatus};
use crate::queue::ConsumerReaper;

struct Replication {
    replicator: Arc<LiveReplicator>,
    coordinator: Arc<FailoverCoordinator>,
    backup: JoinHandle<std::result::Result<BackupReplica, ReplError>>,
    heartbeat: JoinHandle<()>,
}

/// A running broker.
pub struct Broker {
    config: BrokerConfig,
    journal: Arc<FileJournal>,
    post_office: Arc<PostOffice>,
    grouping: Option<Arc<dyn GroupingHandler>>,
    replication: Option<Replication>,
    tasks: Vec<JoinHandle<()>>,
    background: Option<TokioExecutor>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("data_dir", &self.config.data_dir)
            .field("queues", &self.post_office.queues().len())
            .field("replicating", &self.replication.is_some())
            .finish()
    }
}

impl Broker {
    /// Opens storage under `config.data_dir`, recovers, and starts the
    /// background tasks. Must be called inside a tokio runtime.
    ///
    /// With replication enabled the backup receives a snapshot of storage as
    /// found on disk before recovery runs; recovery and everything after it
    /// reach the backup as mirrored ops.
    pub fn start(config: BrokerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let journal = Arc::new(FileJournal::open(FileJournalConfig {
            path: config.journal_path(),
            sync_on_commit: config.journal.sync_on_commit,
        })?);
        let dyn_journal: Arc<dyn Journal> = journal.clone();

        let background = TokioExecutor::current();
        let executor: Arc<dyn Executor> = match &background {
            Some(executor) => Arc::new(executor.clone()),
            None => {
                warn!("no tokio runtime; background work runs inline");
                Arc::new(DirectExecutor)
            }
        };

        let notifications = Arc::new(NotificationService::new());
        let post_office = Arc::new(PostOffice::new(
            Arc::clone(&dyn_journal),
            executor,
            PagingManagerConfig {
                root: config.paging_root(),
                global_max_size: config.paging.global_max_size,
                default_settings: config.address_settings.clone(),
                overrides: config.address_overrides.clone(),
            },
            config.duplicate_cache.clone(),
            Arc::clone(&notifications),
            config.route_when_no_consumers,
        ));

        let replication = if config.replication.enabled {
            Some(Self::start_replication(&config, &journal, &post_office)?)
        } else {
            None
        };

        let mut tasks = Vec::new();
        let records = journal.records();
        let grouping: Option<Arc<dyn GroupingHandler>> = match config.grouping.mode {
            GroupingMode::None => None,
            GroupingMode::Local => {
                let group_timeout = (config.grouping.group_timeout_ms > 0)
                    .then(|| Duration::from_millis(config.grouping.group_timeout_ms));
                let handler = LocalGroupingHandler::new(
                    config.grouping.name.clone(),
                    Arc::clone(&dyn_journal),
                    Arc::clone(&notifications),
                    group_timeout,
                );
                handler.load(&records)?;
                if group_timeout.is_some() {
                    tasks.push(handler.start_reaper(Duration::from_millis(
                        config.grouping.reaper_period_ms.max(1),
                    )));
                }
                Some(handler as Arc<dyn GroupingHandler>)
            }
            GroupingMode::Remote => Some(RemoteGroupingHandler::new(
                config.grouping.name.clone(),
                Arc::clone(&notifications),
                Duration::from_millis(config.grouping.timeout_ms),
            ) as Arc<dyn GroupingHandler>),
        };
        post_office.set_grouping_handler(grouping.clone());
        post_office.recover(&records)?;

        for queue in &config.queues {
            if post_office.queues().get_by_name(&queue.name).is_none() {
                post_office.create_queue(queue.clone())?;
            }
        }

        let period = Duration::from_millis(config.consumers.check_period_ms.max(1));
        tasks.push(
            ConsumerReaper::new(
                Arc::clone(post_office.queues()),
                Arc::clone(&notifications),
                Duration::from_millis(config.consumers.ttl_ms),
            )
            .spawn(period),
        );
        tasks.push(Self::spawn_expiry(Arc::downgrade(&post_office), period));

        info!(
            data_dir = %config.data_dir.display(),
            queues = post_office.queues().len(),
            grouping = ?config.grouping.mode,
            replication = replication.is_some(),
            "broker started"
        );

        Ok(Self {
            config,
            journal,
            post_office,
            grouping,
            replication,
            tasks,
            background,
        })
    }

    fn start_replication(
        config: &BrokerConfig,
        journal: &Arc<FileJournal>,
        post_office: &PostOffice,
    ) -> Result<Replication> {
        let backup_dir = config.backup_dir();
        // every start resynchronizes the backup from scratch
        if backup_dir.exists() {
            info!(backup_dir = %backup_dir.display(), "discarding previous backup state");
            std::fs::remove_dir_all(&backup_dir)?;
        }
        let backup_journal: Arc<dyn Journal> = Arc::new(FileJournal::open(FileJournalConfig {
            path: backup_dir.join(&config.journal.file_name),
            sync_on_commit: config.journal.sync_on_commit,
        })?);
        // the backup mirrors the data directory layout so it can be started
        // as a broker once promoted
        let replica = BackupReplica::new(backup_journal, backup_dir.join(&config.paging.directory));

        let (live_end, backup_end) = Conduit::new_pair();
        let replicator = Arc::new(LiveReplicator::new(live_end));
        let mirror: Arc<dyn ReplicationMirror> = replicator.clone();
        journal.set_mirror(Some(Arc::clone(&mirror)));
        post_office.paging().set_mirror(Some(mirror));
        replicator.synchronize(journal.as_ref(), &config.paging_root())?;

        let coordinator = Arc::new(FailoverCoordinator::new(FailoverConfig {
            failure_threshold: config.replication.failure_threshold,
            check_interval_ms: config.replication.heartbeat_interval_ms,
        }));
        let backup = tokio::spawn(replica.run(backup_end, Arc::clone(&coordinator)));
        let heartbeat = replicator.start_heartbeat(Duration::from_millis(
            config.replication.heartbeat_interval_ms.max(1),
        ));
        info!(backup_dir = %backup_dir.display(), "replication started");

        Ok(Replication {
            replicator,
            coordinator,
            backup,
            heartbeat,
        })
    }

    fn spawn_expiry(post_office: std::sync::Weak<PostOffice>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(post_office) = post_office.upgrade() else {
                    break;
                };
                if let Err(e) = post_office.expire(now_millis()) {
                    warn!(error = %e, "expiry scan failed");
                }
            }
        })
    }

    /// Configuration the broker was started with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The post office.
    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    /// The live journal.
    pub fn journal(&self) -> Arc<dyn Journal> {
        self.journal.clone()
    }

    /// Grouping handler in effect, if grouping is enabled.
    pub fn grouping(&self) -> Option<&Arc<dyn GroupingHandler>> {
        self.grouping.as_ref()
    }

    /// Starts a transaction on the live journal.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.journal())
    }

    /// Routes `message` outside any transaction.
    pub fn send(&self, message: Message) -> Result<RoutingStatus> {
        self.post_office.route(message, None)
    }

    /// Failover coordinator of the in-process backup.
    pub fn failover(&self) -> Option<Arc<FailoverCoordinator>> {
        self.replication
            .as_ref()
            .map(|r| Arc::clone(&r.coordinator))
    }

    /// Live replicator, when replication is enabled.
    pub fn replicator(&self) -> Option<Arc<LiveReplicator>> {
        self.replication
            .as_ref()
            .map(|r| Arc::clone(&r.replicator))
    }

    /// Stops background tasks and replication.
    ///
    /// Returns the backup replica once it has applied everything the live
    /// node sent, so the caller can promote it.
    pub async fn stop(self) -> Result<Option<BackupReplica>> {
        for task in &self.tasks {
            task.abort();
        }
        // journal deletes and depaging still running must reach the mirror
        if let Some(background) = &self.background {
            background.drain().await;
        }

        let replica = match self.replication {
            Some(replication) => {
                replication.heartbeat.abort();
                self.journal.set_mirror(None);
                self.post_office.paging().set_mirror(None);
                if let Err(e) = replication.replicator.stop() {
                    warn!(error = %e, "backup did not receive shutdown notice");
                }
                drop(replication.replicator);
                let replica = replication
                    .backup
                    .await
                    .map_err(|e| crate::error::BrokerError::IllegalState(format!("backup task failed: {e}")))??;
                Some(replica)
            }
            None => None,
        };

        info!(data_dir = %self.config.data_dir.display(), "broker stopped");
        Ok(replica)
    }
}
