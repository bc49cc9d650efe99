//! Inter-node shard RPC
//!
//! The coordinator reaches other servers only through [`ServerConnection`];
//! the gRPC implementation is [`RpcClient`], served by [`ShardService`].

pub mod client;
pub mod server;

use crate::cluster::{ClusterServer, ServerId, ShardId};
use crate::common::Result;
use crate::storage::{Point, ShardQuery, WriteId, WritePayload};
use std::sync::Arc;
use std::time::Duration;

pub use client::RpcClient;
pub use server::{RpcServer, ShardService};

/// A connection to one remote server
#[tonic::async_trait]
pub trait ServerConnection: Send + Sync {
    fn server_id(&self) -> ServerId;

    /// Apply a write the caller already made durable under `write_id`.
    async fn write_shard(
        &self,
        shard_id: ShardId,
        write_id: WriteId,
        payload: &WritePayload,
    ) -> Result<usize>;

    async fn query_shard(&self, shard_id: ShardId, query: &ShardQuery) -> Result<Vec<Point>>;
}

/// Builds a connection from a server's configuration entry
pub type ConnectionFactory =
    Arc<dyn Fn(&ClusterServer) -> Result<Arc<dyn ServerConnection>> + Send + Sync>;

/// gRPC connections with `timeout` on every call
pub fn grpc_connection_factory(timeout: Duration) -> ConnectionFactory {
    Arc::new(move |server: &ClusterServer| {
        let client = RpcClient::connect(server, timeout)?;
        Ok(Arc::new(client) as Arc<dyn ServerConnection>)
    })
}
