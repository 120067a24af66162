use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What an address does with new messages once it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFullPolicy {
    /// Spill to page files.
    Page,
    /// Silently discard.
    Drop,
    /// Reject with `AddressFull`.
    Fail,
    /// Hold the producer until space frees up or the block timeout passes.
    Block,
}

/// Memory and paging limits of one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSettings {
    /// Memory budget in bytes; -1 for unlimited.
    pub max_size_bytes: i64,
    /// A page file is sealed once it reaches this size.
    pub page_size_bytes: u64,
    /// Behaviour when the budget is exhausted.
    pub address_full_policy: AddressFullPolicy,
    /// Where expired messages are sent; dropped when unset.
    pub expiry_address: Option<String>,
    /// Longest a producer waits under the block policy.
    pub block_timeout_ms: u64,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: -1,
            page_size_bytes: 10 * 1024 * 1024,
            address_full_policy: AddressFullPolicy::Page,
            expiry_address: None,
            block_timeout_ms: 30_000,
        }
    }
}

/// Journal location and durability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// File name under the data directory.
    pub file_name: String,
    /// fsync on every commit and non-transactional write.
    pub sync_on_commit: bool,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            file_name: String::from("journal.hmq"),
            sync_on_commit: true,
        }
    }
}

/// Page file location and the global memory budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingSettings {
    /// Directory under the data directory.
    pub directory: String,
    /// Budget across every address; -1 for unlimited.
    pub global_max_size: i64,
}

impl Default for PagingSettings {
    fn default() -> Self {
        Self {
            directory: String::from("paging"),
            global_max_size: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateCacheSettings {
    /// IDs remembered per address; 0 disables detection.
    pub capacity: usize,
    /// Journal the IDs so they survive a restart.
    pub persist: bool,
}

impl Default for DuplicateCacheSettings {
    fn default() -> Self {
        Self {
            capacity: 2000,
            persist: true,
        }
    }
}

/// Role of this node in group arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// Group IDs are not interpreted.
    None,
    /// This node decides group placement.
    Local,
    /// Another node decides; proposals are broadcast.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingSettings {
    pub mode: GroupingMode,
    /// Handler name carried in notifications.
    pub name: String,
    /// How long a remote proposal waits for the arbiter.
    pub timeout_ms: u64,
    /// Arbiter forgets groups unused for this long; 0 keeps them forever.
    pub group_timeout_ms: u64,
    pub reaper_period_ms: u64,
}

impl Default for GroupingSettings {
    fn default() -> Self {
        Self {
            mode: GroupingMode::None,
            name: String::from("harbormq"),
            timeout_ms: 5_000,
            group_timeout_ms: 0,
            reaper_period_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Consumers silent for longer are closed.
    pub ttl_ms: u64,
    pub check_period_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            check_period_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Mirror the journal and page files to an in-process backup.
    pub enabled: bool,
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before the live node is declared failed.
    pub failure_threshold: u32,
    /// Backup data directory; `<data_dir>/backup` when unset.
    pub backup_dir: Option<PathBuf>,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_interval_ms: 1_000,
            failure_threshold: 3,
            backup_dir: None,
        }
    }
}

/// A queue created at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    /// Filter expression; every message matches when unset.
    #[serde(default)]
    pub filter: Option<String>,
    /// Defaults to the address name.
    #[serde(default)]
    pub routing_name: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
}

fn default_true() -> bool {
    true
}

impl QueueConfig {
    /// A durable, unfiltered queue.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            durable: true,
            filter: None,
            routing_name: None,
            exclusive: false,
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub data_dir: PathBuf,
    pub journal: JournalSettings,
    pub paging: PagingSettings,
    /// Settings of addresses without an override.
    pub address_settings: AddressSettings,
    pub address_overrides: HashMap<String, AddressSettings>,
    pub duplicate_cache: DuplicateCacheSettings,
    pub grouping: GroupingSettings,
    pub consumers: ConsumerSettings,
    pub replication: ReplicationSettings,
    pub queues: Vec<QueueConfig>,
    /// Round-robin ignores consumer presence.
    pub route_when_no_consumers: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/harbormq"),
            journal: JournalSettings::default(),
            paging: PagingSettings::default(),
            address_settings: AddressSettings::default(),
            address_overrides: HashMap::new(),
            duplicate_cache: DuplicateCacheSettings::default(),
            grouping: GroupingSettings::default(),
            consumers: ConsumerSettings::default(),
            replication: ReplicationSettings::default(),
            queues: Vec::new(),
            route_when_no_consumers: false,
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Journal file path.
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(&self.journal.file_name)
    }

    /// Page directory root.
    pub fn paging_root(&self) -> PathBuf {
        self.data_dir.join(&self.paging.directory)
    }

    /// Backup data directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.replication
            .backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backup"))
    }
}
