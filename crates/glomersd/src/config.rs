//! Configuration for glomersd

use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Which protocol family the node serves. Decides how `read` is answered and
/// which background loops run.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    /// Gossip broadcast (`broadcast`, `read` → `messages`)
    Broadcast,
    /// Grow-only counter (`add`, `read` → `value`)
    GCounter,
    /// Replicated log (`send`, `poll`, `commit_offsets`, `list_committed_offsets`)
    Kafka,
}

/// How the gossip neighbor list is chosen when `topology` arrives.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyStrategy {
    /// Use the harness topology as given
    Provided,
    /// Every other node is a neighbor
    Mesh,
    /// k-ary spanning tree over the sorted node ids
    Tree,
}

const DEFAULT_TREE_BRANCHING: usize = 4;
const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 200;
const DEFAULT_GOSSIP_RETRY_MS: u64 = 600;
const DEFAULT_GOSSIP_BATCH_MAX: usize = 256;
const DEFAULT_COUNTER_INTERVAL_MS: u64 = 500;
const DEFAULT_COUNTER_STABLE_ROUNDS: u32 = 10;
const DEFAULT_REPLICATION_INTERVAL_MS: u64 = 100;
const DEFAULT_REPLICATION_RETRY_MS: u64 = 500;
const DEFAULT_REPLICATION_BATCH_MAX: usize = 100;
const DEFAULT_POLL_BATCH_MAX: usize = 50;
const DEFAULT_GAP_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_PENDING_ENTRIES: usize = 1024;
const DEFAULT_MAX_RESYNC_ATTEMPTS: u32 = 5;

/// glomersd - gossip broadcast, grow-only counter, and replicated log node
#[derive(Parser, Debug, Clone)]
#[command(name = "glomersd")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Protocol family served by this node
    #[arg(long, value_enum, default_value_t = Workload::Broadcast, env = "GLOMERS_WORKLOAD")]
    pub workload: Workload,

    /// Neighbor selection strategy
    #[arg(long, value_enum, default_value_t = TopologyStrategy::Provided, env = "GLOMERS_TOPOLOGY")]
    pub topology_strategy: TopologyStrategy,

    /// Branching factor for the tree strategy
    #[arg(long, default_value_t = DEFAULT_TREE_BRANCHING)]
    pub tree_branching: usize,

    /// Gossip round interval (milliseconds)
    #[arg(long, default_value_t = DEFAULT_GOSSIP_INTERVAL_MS, env = "GLOMERS_GOSSIP_INTERVAL_MS")]
    pub gossip_interval_ms: u64,

    /// Age after which an unacknowledged gossip value is sent again (milliseconds)
    #[arg(long, default_value_t = DEFAULT_GOSSIP_RETRY_MS)]
    pub gossip_retry_ms: u64,

    /// Maximum values per gossip message
    #[arg(long, default_value_t = DEFAULT_GOSSIP_BATCH_MAX)]
    pub gossip_batch_max: usize,

    /// Counter merge interval (milliseconds)
    #[arg(long, default_value_t = DEFAULT_COUNTER_INTERVAL_MS, env = "GLOMERS_COUNTER_INTERVAL_MS")]
    pub counter_interval_ms: u64,

    /// Peers contacted per counter merge round (0 = ceil(log2(cluster size)))
    #[arg(long, default_value_t = 0)]
    pub counter_fanout: usize,

    /// Unchanged rounds after which counter merges pause
    #[arg(long, default_value_t = DEFAULT_COUNTER_STABLE_ROUNDS)]
    pub counter_stable_rounds: u32,

    /// Replication push interval (milliseconds)
    #[arg(
        long,
        default_value_t = DEFAULT_REPLICATION_INTERVAL_MS,
        env = "GLOMERS_REPLICATION_INTERVAL_MS"
    )]
    pub replication_interval_ms: u64,

    /// Age after which an unacknowledged push or commit forward is sent again (milliseconds)
    #[arg(long, default_value_t = DEFAULT_REPLICATION_RETRY_MS)]
    pub replication_retry_ms: u64,

    /// Maximum entries per replication push
    #[arg(long, default_value_t = DEFAULT_REPLICATION_BATCH_MAX)]
    pub replication_batch_max: usize,

    /// Maximum entries returned per key by `poll`
    #[arg(long, default_value_t = DEFAULT_POLL_BATCH_MAX)]
    pub poll_batch_max: usize,

    /// How long a replica waits on a gap before asking for a resync (milliseconds)
    #[arg(long, default_value_t = DEFAULT_GAP_TIMEOUT_MS)]
    pub gap_timeout_ms: u64,

    /// Maximum out-of-order entries a replica buffers per key
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_ENTRIES)]
    pub max_pending_entries: usize,

    /// Resync attempts before a key is reported as degraded
    #[arg(long, default_value_t = DEFAULT_MAX_RESYNC_ATTEMPTS)]
    pub max_resync_attempts: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

/// Built-in defaults, independent of the command line and environment.
impl Default for Config {
    fn default() -> Self {
        Self {
            workload: Workload::Broadcast,
            topology_strategy: TopologyStrategy::Provided,
            tree_branching: DEFAULT_TREE_BRANCHING,
            gossip_interval_ms: DEFAULT_GOSSIP_INTERVAL_MS,
            gossip_retry_ms: DEFAULT_GOSSIP_RETRY_MS,
            gossip_batch_max: DEFAULT_GOSSIP_BATCH_MAX,
            counter_interval_ms: DEFAULT_COUNTER_INTERVAL_MS,
            counter_fanout: 0,
            counter_stable_rounds: DEFAULT_COUNTER_STABLE_ROUNDS,
            replication_interval_ms: DEFAULT_REPLICATION_INTERVAL_MS,
            replication_retry_ms: DEFAULT_REPLICATION_RETRY_MS,
            replication_batch_max: DEFAULT_REPLICATION_BATCH_MAX,
            poll_batch_max: DEFAULT_POLL_BATCH_MAX,
            gap_timeout_ms: DEFAULT_GAP_TIMEOUT_MS,
            max_pending_entries: DEFAULT_MAX_PENDING_ENTRIES,
            max_resync_attempts: DEFAULT_MAX_RESYNC_ATTEMPTS,
            verbose: false,
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("gossip-interval-ms", self.gossip_interval_ms),
            ("counter-interval-ms", self.counter_interval_ms),
            ("replication-interval-ms", self.replication_interval_ms),
            ("gap-timeout-ms", self.gap_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("--{} must be greater than zero", name);
            }
        }
        if self.gossip_batch_max == 0 || self.replication_batch_max == 0 || self.poll_batch_max == 0
        {
            anyhow::bail!("Batch sizes must be greater than zero");
        }
        if self.gossip_retry_ms < self.gossip_interval_ms {
            anyhow::bail!("Gossip retry interval cannot be shorter than the gossip interval");
        }
        if self.replication_retry_ms < self.replication_interval_ms {
            anyhow::bail!(
                "Replication retry interval cannot be shorter than the replication interval"
            );
        }
        if self.topology_strategy == TopologyStrategy::Tree && self.tree_branching == 0 {
            anyhow::bail!("Tree branching factor must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty, got {}", self.log_format);
        }
        Ok(())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn gossip_retry(&self) -> Duration {
        Duration::from_millis(self.gossip_retry_ms)
    }

    pub fn counter_interval(&self) -> Duration {
        Duration::from_millis(self.counter_interval_ms)
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    pub fn replication_retry(&self) -> Duration {
        Duration::from_millis(self.replication_retry_ms)
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.workload, Workload::Broadcast);
        assert_eq!(config.topology_strategy, TopologyStrategy::Provided);
        assert_eq!(config.poll_batch_max, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_workload_names() {
        let config = Config::parse_from(["glomersd", "--workload", "g-counter"]);
        assert_eq!(config.workload, Workload::GCounter);

        let config = Config::parse_from([
            "glomersd",
            "--workload",
            "kafka",
            "--topology-strategy",
            "tree",
            "--tree-branching",
            "3",
        ]);
        assert_eq!(config.workload, Workload::Kafka);
        assert_eq!(config.topology_strategy, TopologyStrategy::Tree);
        assert_eq!(config.tree_branching, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.gossip_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gossip_retry_ms = config.gossip_interval_ms - 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.poll_batch_max = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
