//! Raft messages exchanged between nodes, and their wire conversions

use crate::cluster::ClusterCommand;
use crate::common::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    /// Raft connection string of the leader, so followers can forward proposals
    pub leader_addr: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On failure, the index the leader should retry from (0 when unknown)
    pub conflict_index: u64,
    /// On success, the last index known to match the leader
    pub match_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_addr: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResponse {
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// bincode `ClusterCommand`
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: &ClusterCommand) -> Result<Self> {
        Ok(Self {
            index,
            term,
            data: bincode::serialize(command)?,
        })
    }
}

// === Wire conversions ===

impl From<&VoteRequest> for crate::proto::VoteRequest {
    fn from(req: &VoteRequest) -> Self {
        Self {
            term: req.term,
            candidate_id: req.candidate_id.clone(),
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<crate::proto::VoteRequest> for VoteRequest {
    fn from(req: crate::proto::VoteRequest) -> Self {
        Self {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<&VoteResponse> for crate::proto::VoteResponse {
    fn from(resp: &VoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<crate::proto::VoteResponse> for VoteResponse {
    fn from(resp: crate::proto::VoteResponse) -> Self {
        Self {
            term: resp.term,
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<&LogEntry> for crate::proto::LogEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            data: entry.data.clone(),
        }
    }
}

impl From<crate::proto::LogEntry> for LogEntry {
    fn from(entry: crate::proto::LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            data: entry.data,
        }
    }
}

impl From<&AppendRequest> for crate::proto::AppendRequest {
    fn from(req: &AppendRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id.clone(),
            leader_addr: req.leader_addr.clone(),
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.iter().map(Into::into).collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<crate::proto::AppendRequest> for AppendRequest {
    fn from(req: crate::proto::AppendRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id,
            leader_addr: req.leader_addr,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(Into::into).collect(),
            leader_commit: req.leader_commit,
        }
    }
}

impl From<&AppendResponse> for crate::proto::AppendResponse {
    fn from(resp: &AppendResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            conflict_index: resp.conflict_index,
            match_index: resp.match_index,
        }
    }
}

impl From<crate::proto::AppendResponse> for AppendResponse {
    fn from(resp: crate::proto::AppendResponse) -> Self {
        Self {
            term: resp.term,
            success: resp.success,
            conflict_index: resp.conflict_index,
            match_index: resp.match_index,
        }
    }
}

impl From<&SnapshotRequest> for crate::proto::SnapshotRequest {
    fn from(req: &SnapshotRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id.clone(),
            leader_addr: req.leader_addr.clone(),
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            data: req.data.clone(),
        }
    }
}

impl From<crate::proto::SnapshotRequest> for SnapshotRequest {
    fn from(req: crate::proto::SnapshotRequest) -> Self {
        Self {
            term: req.term,
            leader_id: req.leader_id,
            leader_addr: req.leader_addr,
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            data: req.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_request_wire_conversion_keeps_entries() {
        let req = AppendRequest {
            term: 3,
            leader_id: "a".into(),
            leader_addr: "http://a:8090".into(),
            prev_log_index: 4,
            prev_log_term: 2,
            entries: vec![LogEntry::new(5, 3, &ClusterCommand::Noop).unwrap()],
            leader_commit: 4,
        };
        let wire: crate::proto::AppendRequest = (&req).into();
        assert_eq!(wire.entries.len(), 1);
        assert_eq!(AppendRequest::from(wire), req);
    }
}
