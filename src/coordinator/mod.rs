//! Coordination layer
//!
//! The coordinator is responsible for:
//! - Resolving the shard and owners of every write and query
//! - Logging writes in the WAL before applying them
//! - Applying locally and forwarding to remote owners
//! - Merging query results across shards

pub mod local;
pub mod router;

use crate::cluster::{ClusterServer, ServerId, ShardId};
use crate::common::{Result, ShardWriteReport};
use crate::storage::{Point, ShardQuery, WritePayload};

pub use local::LocalShards;
pub use router::CoordinatorImpl;

/// Which shards a write or query addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardTarget {
    /// One shard, by id
    Shard(ShardId),
    /// The shards covering the timestamps involved, created on demand for writes
    ByTime,
}

/// A membership change the coordinator must reflect in its connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Upserted(ClusterServer),
    Removed(ServerId),
}

#[tonic::async_trait]
pub trait Coordinator: Send + Sync {
    /// Durably accept a write. Returns one report per shard touched; fails with
    /// `PartialWrite` unless every owner of every shard acknowledged.
    async fn write(&self, target: ShardTarget, payload: WritePayload) -> Result<Vec<ShardWriteReport>>;

    /// Read from every addressed shard and merge by (series, timestamp).
    async fn query(&self, target: ShardTarget, query: ShardQuery) -> Result<Vec<Point>>;

    /// Open connections to every other known server. Called once the local id is known.
    fn connect_to_peers(&self, self_id: ServerId) -> Result<()>;

    fn peer_changed(&self, change: PeerChange);
}
