//! Raft consensus over the cluster configuration
//!
//! The replicated log carries [`ClusterCommand`](crate::cluster::ClusterCommand)s;
//! every node applies committed entries, in order, to its
//! [`ClusterConfiguration`](crate::cluster::ClusterConfiguration).

pub mod client;
pub mod log;
pub mod messages;
pub mod node;
pub mod server;
pub mod storage;
pub mod transport;

pub use client::RaftClient;
pub use log::RaftLog;
pub use messages::{
    AppendRequest, AppendResponse, LogEntry, SnapshotRequest, SnapshotResponse, VoteRequest,
    VoteResponse,
};
pub use node::{RaftNode, RaftRole, RaftTimings, Replication, TickAction};
pub use server::ConsensusServer;
pub use storage::{HardState, RaftStorage, Snapshot};
