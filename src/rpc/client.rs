use crate::cluster::{ClusterServer, ServerId, ShardId};
use crate::common::{Error, Result};
use crate::proto::shard_transport_client::ShardTransportClient;
use crate::proto::{QueryShardRequest, WriteShardRequest};
use crate::rpc::ServerConnection;
use crate::storage::{Point, ShardQuery, WriteId, WritePayload};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Shard RPC client for one remote server
pub struct RpcClient {
    server_id: ServerId,
    addr: String,
    client: ShardTransportClient<Channel>,
}

impl RpcClient {
    /// Create a lazily connected client; nothing is dialed until the first call.
    pub fn connect(server: &ClusterServer, timeout: Duration) -> Result<Self> {
        let addr = server.connection.rpc_connection_string.clone();
        let channel = Endpoint::from_shared(addr.clone())
            .map_err(|e| Error::InvalidConfig(format!("bad rpc address {}: {}", addr, e)))?
            .timeout(timeout)
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            server_id: server.id,
            addr,
            client: ShardTransportClient::new(channel),
        })
    }

    fn map_status(&self, shard_id: ShardId, status: tonic::Status) -> Error {
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled => {
                Error::Unreachable {
                    server: format!("{} ({})", self.server_id, self.addr),
                    reason: status.message().to_string(),
                }
            }
            tonic::Code::NotFound => Error::ShardNotFound(shard_id),
            _ => Error::Grpc(status),
        }
    }
}

#[tonic::async_trait]
impl ServerConnection for RpcClient {
    fn server_id(&self) -> ServerId {
        self.server_id
    }

    async fn write_shard(
        &self,
        shard_id: ShardId,
        write_id: WriteId,
        payload: &WritePayload,
    ) -> Result<usize> {
        let request = tonic::Request::new(WriteShardRequest {
            shard_id,
            origin_server: write_id.server.0,
            origin_sequence: write_id.sequence,
            payload: bincode::serialize(payload)?,
        });

        let response = self
            .client
            .clone()
            .write_shard(request)
            .await
            .map_err(|s| self.map_status(shard_id, s))?;
        Ok(response.into_inner().points_written as usize)
    }

    async fn query_shard(&self, shard_id: ShardId, query: &ShardQuery) -> Result<Vec<Point>> {
        let request = tonic::Request::new(QueryShardRequest {
            shard_id,
            query: bincode::serialize(query)?,
        });

        let response = self
            .client
            .clone()
            .query_shard(request)
            .await
            .map_err(|s| self.map_status(shard_id, s))?;
        let points = bincode::deserialize(&response.into_inner().points)?;
        Ok(points)
    }
}
