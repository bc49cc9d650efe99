//! Raft gRPC service
//!
//! Exposes the consensus RPCs peers use: elections, log replication, snapshot
//! transfer, proposal forwarding and join requests.

use crate::cluster::ClusterCommand;
use crate::common::Error;
use crate::consensus::server::RaftCore;
use crate::proto::raft_transport_server::RaftTransport;
use crate::proto::*;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct RaftService {
    core: Arc<RaftCore>,
}

impl RaftService {
    pub(crate) fn new(core: Arc<RaftCore>) -> Self {
        Self { core }
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftService {
    async fn request_vote(
        &self,
        req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = req.into_inner().into();
        let resp = self
            .core
            .request_vote(&req)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new((&resp).into()))
    }

    async fn append_entries(
        &self,
        req: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        let resp = self
            .core
            .append_entries(req.into_inner().into())
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new((&resp).into()))
    }

    async fn install_snapshot(
        &self,
        req: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let resp = self
            .core
            .install_snapshot(req.into_inner().into())
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(SnapshotResponse { term: resp.term }))
    }

    /// Proposals forwarded by followers. Only the leader accepts them.
    async fn propose(
        &self,
        req: Request<ProposeRequest>,
    ) -> Result<Response<ProposeResponse>, Status> {
        let command: ClusterCommand = bincode::deserialize(&req.into_inner().command)
            .map_err(|e| Status::invalid_argument(format!("bad command: {}", e)))?;

        if !self.core.is_leader() {
            return Ok(Response::new(ProposeResponse {
                error_code: PROPOSE_NOT_LEADER,
                error: self
                    .core
                    .leader_addr()
                    .unwrap_or_else(|| "unknown".to_string()),
                ..Default::default()
            }));
        }

        let resp = match self.core.propose_as_leader(&command).await {
            Ok((index, response)) => ProposeResponse {
                index,
                response: bincode::serialize(&response)
                    .map_err(|e| Status::internal(e.to_string()))?,
                error_code: PROPOSE_OK,
                error: String::new(),
            },
            Err(Error::NotLeader(leader)) => ProposeResponse {
                error_code: PROPOSE_NOT_LEADER,
                error: leader,
                ..Default::default()
            },
            Err(Error::NoQuorum(reason)) => ProposeResponse {
                error_code: PROPOSE_NO_QUORUM,
                error: reason,
                ..Default::default()
            },
            Err(e) => ProposeResponse {
                error_code: PROPOSE_FAILED,
                error: e.to_string(),
                ..Default::default()
            },
        };
        Ok(Response::new(resp))
    }

    async fn join(&self, req: Request<JoinRequest>) -> Result<Response<JoinResponse>, Status> {
        let server_id = self
            .core
            .join(req.into_inner())
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(JoinResponse {
            server_id: server_id.0,
        }))
    }
}
