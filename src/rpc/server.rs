//! Shard gRPC service (internal)
//!
//! Receives writes forwarded by the coordinating server and answers shard queries
//! from local data.

use crate::cluster::ServerId;
use crate::common::Result;
use crate::coordinator::LocalShards;
use crate::proto::shard_transport_server::{ShardTransport, ShardTransportServer};
use crate::proto::*;
use crate::storage::{ShardQuery, WriteId, WritePayload};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

pub struct ShardService {
    local: Arc<LocalShards>,
}

impl ShardService {
    pub fn new(local: Arc<LocalShards>) -> Self {
        Self { local }
    }

    pub fn into_server(self) -> ShardTransportServer<Self> {
        ShardTransportServer::new(self)
    }
}

#[tonic::async_trait]
impl ShardTransport for ShardService {
    async fn write_shard(
        &self,
        req: Request<WriteShardRequest>,
    ) -> std::result::Result<Response<WriteShardResponse>, Status> {
        let req = req.into_inner();
        let payload: WritePayload = bincode::deserialize(&req.payload)
            .map_err(|e| Status::invalid_argument(format!("bad payload: {}", e)))?;
        let origin = WriteId::new(ServerId(req.origin_server), req.origin_sequence);

        let written = self
            .local
            .apply_forwarded(req.shard_id, origin, payload)
            .await
            .map_err(|e| {
                tracing::warn!(
                    "Forwarded write {} to shard {} failed: {}",
                    origin,
                    req.shard_id,
                    e
                );
                e.to_grpc_status()
            })?;
        Ok(Response::new(WriteShardResponse {
            points_written: written as u64,
        }))
    }

    async fn query_shard(
        &self,
        req: Request<QueryShardRequest>,
    ) -> std::result::Result<Response<QueryShardResponse>, Status> {
        let req = req.into_inner();
        let query: ShardQuery = bincode::deserialize(&req.query)
            .map_err(|e| Status::invalid_argument(format!("bad query: {}", e)))?;

        let points = self
            .local
            .query(req.shard_id, &query)
            .map_err(|e| e.to_grpc_status())?;
        let points = bincode::serialize(&points).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(QueryShardResponse { points }))
    }
}

/// The running shard RPC endpoint
pub struct RpcServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RpcServer {
    /// Bind `addr` and serve until `shutdown` flips to true.
    pub async fn start(
        addr: SocketAddr,
        local: Arc<LocalShards>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Shard RPC listening on {}", local_addr);

        let service = ShardService::new(local);
        let mut shutdown = shutdown;
        let handle = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Shard RPC server error: {}", e);
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the server to finish after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!("Shard RPC task ended abnormally: {}", e);
        }
    }
}
