//! Node-to-node wire messages
//!
//! The `RaftTransport` and `ShardTransport` service stubs are generated by `build.rs`;
//! the messages they carry are declared here. Payloads that only chronodb itself
//! reads (commands, points, queries) travel as opaque bincode bytes.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/chronodb.RaftTransport.rs"));
include!(concat!(env!("OUT_DIR"), "/chronodb.ShardTransport.rs"));

// === Consensus ===

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub candidate_id: String,
    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    #[prost(string, tag = "3")]
    pub leader_addr: String,
    #[prost(uint64, tag = "4")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "5")]
    pub prev_log_term: u64,
    #[prost(message, repeated, tag = "6")]
    pub entries: Vec<LogEntry>,
    #[prost(uint64, tag = "7")]
    pub leader_commit: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(uint64, tag = "3")]
    pub conflict_index: u64,
    #[prost(uint64, tag = "4")]
    pub match_index: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SnapshotRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    #[prost(string, tag = "3")]
    pub leader_addr: String,
    #[prost(uint64, tag = "4")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "5")]
    pub last_included_term: u64,
    #[prost(bytes = "vec", tag = "6")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProposeRequest {
    /// bincode `ClusterCommand`
    #[prost(bytes = "vec", tag = "1")]
    pub command: Vec<u8>,
}

pub const PROPOSE_OK: u32 = 0;
pub const PROPOSE_NO_QUORUM: u32 = 1;
pub const PROPOSE_NOT_LEADER: u32 = 2;
pub const PROPOSE_FAILED: u32 = 3;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProposeResponse {
    /// Log index the command committed at
    #[prost(uint64, tag = "1")]
    pub index: u64,
    /// bincode `CommandResponse`
    #[prost(bytes = "vec", tag = "2")]
    pub response: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub error_code: u32,
    #[prost(string, tag = "4")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinRequest {
    #[prost(string, tag = "1")]
    pub raft_name: String,
    #[prost(string, tag = "2")]
    pub raft_connection_string: String,
    #[prost(string, tag = "3")]
    pub rpc_connection_string: String,
    #[prost(bool, tag = "4")]
    pub voter: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct JoinResponse {
    #[prost(uint32, tag = "1")]
    pub server_id: u32,
}

// === Shard data ===

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteShardRequest {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    /// Server that accepted the write and assigned its sequence
    #[prost(uint32, tag = "2")]
    pub origin_server: u32,
    #[prost(uint64, tag = "3")]
    pub origin_sequence: u64,
    /// bincode `WritePayload`
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteShardResponse {
    #[prost(uint64, tag = "1")]
    pub points_written: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryShardRequest {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    /// bincode `ShardQuery`
    #[prost(bytes = "vec", tag = "2")]
    pub query: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryShardResponse {
    /// bincode `Vec<Point>`
    #[prost(bytes = "vec", tag = "1")]
    pub points: Vec<u8>,
}
