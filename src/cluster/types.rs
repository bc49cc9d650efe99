//! Cluster configuration data model

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

/// Server id assigned by consensus when a server registers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ServerId(pub u32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

pub type ShardId = u64;

/// Whether a server takes part in elections and quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Leader-eligible, counted for quorum
    Voter,
    /// Replicates the log but never votes or leads
    Follower,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Voter => write!(f, "voter"),
            ServerRole::Follower => write!(f, "follower"),
        }
    }
}

/// Addresses peers use to reach a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub raft_connection_string: String,
    pub rpc_connection_string: String,
}

impl ConnectionInfo {
    pub fn new(raft: impl Into<String>, rpc: impl Into<String>) -> Self {
        Self {
            raft_connection_string: raft.into(),
            rpc_connection_string: rpc.into(),
        }
    }
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "raft={} rpc={}",
            self.raft_connection_string, self.rpc_connection_string
        )
    }
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterServer {
    pub id: ServerId,
    /// Stable identity, kept across restarts and address changes
    pub raft_name: String,
    pub connection: ConnectionInfo,
    pub role: ServerRole,
}

impl ClusterServer {
    pub fn is_voter(&self) -> bool {
        self.role == ServerRole::Voter
    }
}

/// A time range of data and the servers holding it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    /// Inclusive, unix milliseconds
    pub start_time: i64,
    /// Exclusive, unix milliseconds
    pub end_time: i64,
    pub owners: Vec<ServerId>,
}

impl Shard {
    pub fn covers(&self, timestamp: i64) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }

    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start_time < end && start < self.end_time
    }

    pub fn is_local(&self, server_id: ServerId) -> bool {
        self.owners.contains(&server_id)
    }
}

/// Request to create a shard; the id and owners are decided when the command applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDefinition {
    pub start_time: i64,
    pub end_time: i64,
    pub replication_factor: usize,
}

/// The replicated state: identical on every node that applied the same log prefix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub servers: BTreeMap<ServerId, ClusterServer>,
    pub shards: BTreeMap<ShardId, Shard>,
    pub next_server_id: u32,
    pub next_shard_id: u64,
    /// Consensus log index of the last applied command
    pub applied_index: u64,
}

impl ClusterState {
    pub fn server(&self, id: ServerId) -> Option<&ClusterServer> {
        self.servers.get(&id)
    }

    pub fn server_by_name(&self, raft_name: &str) -> Option<&ClusterServer> {
        self.servers.values().find(|s| s.raft_name == raft_name)
    }

    pub fn voters(&self) -> BTreeSet<String> {
        self.servers
            .values()
            .filter(|s| s.is_voter())
            .map(|s| s.raft_name.clone())
            .collect()
    }

    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(&id)
    }

    /// The shard covering `timestamp`; the lowest id wins if ranges overlap.
    pub fn shard_for_timestamp(&self, timestamp: i64) -> Option<&Shard> {
        self.shards.values().find(|s| s.covers(timestamp))
    }

    pub fn shards_overlapping(&self, start: i64, end: i64) -> Vec<&Shard> {
        self.shards
            .values()
            .filter(|s| s.overlaps(start, end))
            .collect()
    }

    pub fn local_shards(&self, server_id: ServerId) -> Vec<&Shard> {
        self.shards
            .values()
            .filter(|s| s.is_local(server_id))
            .collect()
    }

    /// Serialize for a consensus snapshot (bincode, lz4-compressed)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw = bincode::serialize(self)?;
        let mut encoder = lz4::EncoderBuilder::new().level(4).build(Vec::new())?;
        encoder.write_all(&raw)?;
        let (compressed, result) = encoder.finish();
        result?;
        Ok(compressed)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut decoder = lz4::Decoder::new(bytes)?;
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        bincode::deserialize(&raw)
            .map_err(|e| Error::Corrupted(format!("cluster snapshot: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: ShardId, start: i64, end: i64) -> Shard {
        Shard {
            id,
            start_time: start,
            end_time: end,
            owners: vec![ServerId(1)],
        }
    }

    #[test]
    fn test_shard_ranges_are_half_open() {
        let s = shard(1, 100, 200);
        assert!(s.covers(100));
        assert!(!s.covers(200));
        assert!(s.overlaps(150, 300));
        assert!(!s.overlaps(200, 300));
        assert!(!s.overlaps(0, 100));
    }

    #[test]
    fn test_lowest_shard_id_wins_for_timestamp() {
        let mut state = ClusterState::default();
        state.shards.insert(4, shard(4, 0, 1000));
        state.shards.insert(2, shard(2, 500, 1500));
        assert_eq!(state.shard_for_timestamp(700).map(|s| s.id), Some(2));
        assert_eq!(state.shard_for_timestamp(100).map(|s| s.id), Some(4));
        assert!(state.shard_for_timestamp(2000).is_none());
    }

    #[test]
    fn test_snapshot_encoding() {
        let mut state = ClusterState::default();
        state.servers.insert(
            ServerId(1),
            ClusterServer {
                id: ServerId(1),
                raft_name: "a".into(),
                connection: ConnectionInfo::new("http://a:1", "http://a:2"),
                role: ServerRole::Voter,
            },
        );
        state.shards.insert(1, shard(1, 0, 10));
        state.next_server_id = 2;
        state.applied_index = 9;

        let decoded = ClusterState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(ClusterState::decode(b"garbage").is_err());
    }
}
