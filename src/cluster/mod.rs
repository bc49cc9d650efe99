//! Cluster metadata: who the servers are, which shards exist, and who owns them.

pub mod command;
pub mod configuration;
pub mod types;

pub use command::{ClusterCommand, ClusterEvent, CommandRejection, CommandResponse};
pub use configuration::{ClusterConfiguration, ShardCreator};
pub use types::{
    ClusterServer, ClusterState, ConnectionInfo, ServerId, ServerRole, Shard, ShardDefinition,
    ShardId,
};
