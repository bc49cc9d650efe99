//! # chronodb
//!
//! A clustered time-series database node with:
//! - Raft consensus for cluster metadata (servers, shards, ownership)
//! - A per-server write-ahead log (WAL) with crash recovery
//! - Per-shard RocksDB storage
//! - Shard routing and replication over gRPC
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Consensus (Raft)                │
//! │   servers, shards, shard → owners            │
//! └───────────┬──────────────────────────────────┘
//!             │ applies committed commands
//!   ┌─────────▼─────────┐      gRPC       ┌───────────────┐
//!   │ Cluster config    │◄──────────────► │  peer nodes   │
//!   └─────────┬─────────┘                 └───────▲───────┘
//!             │ owners                            │ forwarded writes
//!   ┌─────────▼─────────┐                         │
//!   │   Coordinator     ├─────────────────────────┘
//!   └──┬─────────────┬──┘
//!      │ append      │ apply
//!   ┌──▼───┐     ┌───▼─────────┐
//!   │ WAL  │     │ Shard store │
//!   └──────┘     └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Bootstrap a single node
//! ```bash
//! chronodb-node serve \
//!   --data ./node-1 \
//!   --raft 127.0.0.1:8090 \
//!   --rpc 127.0.0.1:8099 \
//!   --status 127.0.0.1:8086
//! ```
//!
//! ### Join an existing cluster
//! ```bash
//! chronodb-node serve \
//!   --data ./node-2 \
//!   --raft 127.0.0.1:8190 \
//!   --rpc 127.0.0.1:8199 \
//!   --seeds http://127.0.0.1:8090
//! ```
//!
//! ### Inspect the cluster
//! ```bash
//! chronodb status --node http://127.0.0.1:8086
//! chronodb shards
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod consensus;
pub mod coordinator;
pub mod node;
pub mod proto;
pub mod rpc;
pub mod storage;

// Re-export commonly used types
pub use cluster::ClusterConfiguration;
pub use common::{Config, Error, Result};
pub use consensus::ConsensusServer;
pub use coordinator::{Coordinator, CoordinatorImpl};
pub use node::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
