//! Configuration for a chronodb node
//!
//! Loaded once at startup from an optional TOML file and `CHRONODB__*` environment
//! variables, then handed to the core as an immutable snapshot.

use crate::common::utils::parse_duration;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CHRONODB_CONFIG";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root data directory (shard data lives in `<data_dir>/shards`)
    pub data_dir: PathBuf,

    /// Consensus log directory, defaults to `<data_dir>/raft`
    pub raft_dir: Option<PathBuf>,

    /// WAL directory, defaults to `<data_dir>/wal`
    pub wal_dir: Option<PathBuf>,

    /// Bind address for the consensus transport
    pub raft_bind: SocketAddr,

    /// Bind address for the inter-node shard RPC
    pub rpc_bind: SocketAddr,

    /// Bind address for the read-only status API (disabled if unset)
    pub status_bind: Option<SocketAddr>,

    /// Address peers use to reach the consensus transport, defaults to `http://<raft_bind>`
    pub raft_advertise: Option<String>,

    /// Address peers use to reach the shard RPC, defaults to `http://<rpc_bind>`
    pub rpc_advertise: Option<String>,

    /// Consensus connection strings of existing cluster members to join through
    pub seed_servers: Vec<String>,

    /// Whether this node votes and may become leader
    pub leader_eligible: bool,

    /// Timeout for a single inter-node RPC
    pub rpc_timeout_ms: u64,

    /// Owners per shard
    pub replication_factor: usize,

    /// Time span covered by one shard (e.g. "7d", "1h")
    pub shard_duration: String,

    /// How far ahead of now shards are pre-created
    pub shard_lookahead: String,

    /// How often the future shard check runs
    pub shard_check_interval: String,

    /// Raft election timeout (randomized between 1x and 2x)
    pub election_timeout_ms: u64,

    /// Raft heartbeat interval
    pub heartbeat_interval_ms: u64,

    /// How long a proposal waits for commit before reporting no quorum
    pub proposal_timeout_ms: u64,

    /// Applied entries between consensus snapshots
    pub snapshot_threshold: u64,

    /// WAL fsync policy
    pub wal_sync: WalSyncPolicy,

    /// WAL segment roll size
    pub wal_segment_bytes: u64,

    /// Interval between WAL compaction passes
    pub wal_compaction_interval_secs: u64,

    /// Logging level
    pub log_level: String,
}

/// WAL sync policy
///
/// Only `Always` keeps the "acknowledged means durable" guarantee; the others trade it
/// for throughput and exist for benchmarks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every append
    Always,
    /// flush to the OS after every append, fsync once a second in the background
    Interval,
    /// leave buffering to the OS
    Never,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./chronodb-data"),
            raft_dir: None,
            wal_dir: None,
            raft_bind: SocketAddr::from(([0, 0, 0, 0], 8090)),
            rpc_bind: SocketAddr::from(([0, 0, 0, 0], 8099)),
            status_bind: None,
            raft_advertise: None,
            rpc_advertise: None,
            seed_servers: Vec::new(),
            leader_eligible: true,
            rpc_timeout_ms: 2_000,
            replication_factor: 1,
            shard_duration: "7d".to_string(),
            shard_lookahead: "1h".to_string(),
            shard_check_interval: "1m".to_string(),
            election_timeout_ms: 300,
            heartbeat_interval_ms: 50,
            proposal_timeout_ms: 5_000,
            snapshot_threshold: 10_000,
            wal_sync: WalSyncPolicy::Always,
            wal_segment_bytes: 64 * 1024 * 1024,
            wal_compaction_interval_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `$CHRONODB_CONFIG`) and the environment.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("CHRONODB")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("seed_servers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.election_timeout_ms == 0 {
            return Err(Error::InvalidConfig("raft timers must be non-zero".into()));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval_ms ({}) must be below election_timeout_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if !self.leader_eligible && self.seed_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "a node that is not leader eligible needs seed_servers to join".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig("rpc_timeout_ms must be non-zero".into()));
        }
        if self.wal_segment_bytes < 1024 {
            return Err(Error::InvalidConfig(
                "wal_segment_bytes must be at least 1024".into(),
            ));
        }
        if self.shard_duration_ms()? == 0 {
            return Err(Error::InvalidConfig("shard_duration must be non-zero".into()));
        }
        self.shard_lookahead_ms()?;
        if self.shard_check_interval()?.is_zero() {
            return Err(Error::InvalidConfig(
                "shard_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.raft_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("raft"))
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.wal_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wal"))
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.data_dir.join("shards")
    }

    /// Connection string peers use for the consensus transport.
    pub fn raft_connection_string(&self) -> String {
        self.raft_advertise
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.raft_bind))
    }

    /// Connection string peers use for shard RPC.
    pub fn rpc_connection_string(&self) -> String {
        self.rpc_advertise
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.rpc_bind))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn shard_duration(&self) -> Result<Duration> {
        parse_duration(&self.shard_duration)
    }

    pub fn shard_lookahead(&self) -> Result<Duration> {
        parse_duration(&self.shard_lookahead)
    }

    pub fn shard_check_interval(&self) -> Result<Duration> {
        parse_duration(&self.shard_check_interval)
    }

    /// Shard width in milliseconds, the unit of point timestamps
    pub fn shard_duration_ms(&self) -> Result<i64> {
        duration_millis("shard_duration", self.shard_duration()?)
    }

    pub fn shard_lookahead_ms(&self) -> Result<i64> {
        duration_millis("shard_lookahead", self.shard_lookahead()?)
    }
}

fn duration_millis(name: &str, duration: Duration) -> Result<i64> {
    i64::try_from(duration.as_millis())
        .map_err(|_| Error::InvalidConfig(format!("{} is too large", name)))
}
