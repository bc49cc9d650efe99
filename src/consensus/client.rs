//! Raft gRPC client helpers

use crate::common::{Error, Result};
use crate::consensus::messages::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::proto::raft_transport_client::RaftTransportClient;
use crate::proto::{JoinRequest, JoinResponse, ProposeRequest, ProposeResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Map a failed call to the error the consensus layer reports.
pub(crate) fn call_error(server: &str, status: tonic::Status) -> Error {
    match status.code() {
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled => {
            Error::Unreachable {
                server: server.to_string(),
                reason: status.message().to_string(),
            }
        }
        _ => Error::Grpc(status),
    }
}

/// Lazily connected clients, one per peer address
pub struct RaftClient {
    timeout: Duration,
    clients: Mutex<HashMap<String, RaftTransportClient<Channel>>>,
}

impl RaftClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, addr: &str) -> Result<RaftTransportClient<Channel>> {
        if let Some(client) = self.clients.lock().get(addr) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(addr.to_string())
            .map_err(|e| Error::InvalidConfig(format!("bad raft address {}: {}", addr, e)))?
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .connect_lazy();
        let client = RaftTransportClient::new(channel);
        self.clients.lock().insert(addr.to_string(), client.clone());
        Ok(client)
    }

    pub async fn request_vote(&self, addr: &str, req: &VoteRequest) -> Result<VoteResponse> {
        let mut client = self.client(addr)?;
        let resp = client
            .request_vote(crate::proto::VoteRequest::from(req))
            .await
            .map_err(|s| call_error(addr, s))?;
        Ok(resp.into_inner().into())
    }

    pub async fn append_entries(&self, addr: &str, req: &AppendRequest) -> Result<AppendResponse> {
        let mut client = self.client(addr)?;
        let resp = client
            .append_entries(crate::proto::AppendRequest::from(req))
            .await
            .map_err(|s| call_error(addr, s))?;
        Ok(resp.into_inner().into())
    }

    pub async fn install_snapshot(
        &self,
        addr: &str,
        req: &SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        let mut client = self.client(addr)?;
        let resp = client
            .install_snapshot(crate::proto::SnapshotRequest::from(req))
            .await
            .map_err(|s| call_error(addr, s))?;
        Ok(SnapshotResponse {
            term: resp.into_inner().term,
        })
    }

    pub async fn propose(&self, addr: &str, command: Vec<u8>) -> Result<ProposeResponse> {
        let mut client = self.client(addr)?;
        let resp = client
            .propose(ProposeRequest { command })
            .await
            .map_err(|s| call_error(addr, s))?;
        Ok(resp.into_inner())
    }

    pub async fn join(&self, addr: &str, req: JoinRequest) -> Result<JoinResponse> {
        let mut client = self.client(addr)?;
        let resp = client
            .join(req)
            .await
            .map_err(|s| call_error(addr, s))?;
        Ok(resp.into_inner())
    }
}
