//! Error types for chronodb

use crate::cluster::ServerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of forwarding one shard's write to each owner.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ShardWriteReport {
    pub shard_id: u64,
    pub sequence: u64,
    pub succeeded: Vec<ServerId>,
    pub failed: Vec<(ServerId, String)>,
}

impl ShardWriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A query whose shards did not all answer. Carries the data that did arrive.
#[derive(Debug, Clone)]
pub struct PartialQuery {
    pub points: Vec<crate::storage::Point>,
    pub failed_shards: Vec<(u64, String)>,
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL recovery failed: {0}")]
    Recovery(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Raft Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No quorum: {0}")]
    NoQuorum(String),

    #[error("Raft error: {0}")]
    Raft(String),

    // === Membership Errors ===
    #[error("Membership conflict: {raft_name} is already registered at {existing}")]
    MembershipConflict { raft_name: String, existing: String },

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("No servers available to own a shard")]
    NoServers,

    #[error("Command rejected: {0}")]
    Rejected(String),

    // === Routing Errors ===
    #[error("Shard not found: {0}")]
    ShardNotFound(u64),

    #[error("Server {server} unreachable: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("Write not acknowledged by all owners: {}", describe_partial_write(.0))]
    PartialWrite(Vec<ShardWriteReport>),

    #[error("Query incomplete: {} shard(s) failed", .0.failed_shards.len())]
    PartialQuery(Box<PartialQuery>),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Lifecycle ===
    #[error("Node is not ready to serve traffic")]
    NotReady,

    #[error("Node is shutting down")]
    ShuttingDown,

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

fn describe_partial_write(reports: &[ShardWriteReport]) -> String {
    reports
        .iter()
        .filter(|r| !r.is_complete())
        .map(|r| {
            let failed: Vec<String> = r
                .failed
                .iter()
                .map(|(server, reason)| format!("{} ({})", server, reason))
                .collect();
            format!("shard {} failed on {}", r.shard_id, failed.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Unreachable { .. }
                | Error::NoQuorum(_)
                | Error::NotLeader(_)
                | Error::PartialWrite(_)
                | Error::NotReady
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::ShardNotFound(_) | Error::UnknownServer(_) => {
                tonic::Status::new(Code::NotFound, self.to_string())
            }
            Error::NotLeader(leader) => {
                let mut status = tonic::Status::new(Code::FailedPrecondition, self.to_string());
                if let Ok(value) = leader.parse() {
                    status.metadata_mut().insert("leader", value);
                }
                status
            }
            Error::NoQuorum(_) | Error::NotReady | Error::ShuttingDown => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::InvalidConfig(_) | Error::Rejected(_) | Error::NoServers => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::MembershipConflict { .. } => {
                tonic::Status::new(Code::AlreadyExists, self.to_string())
            }
            Error::Timeout(_) => tonic::Status::new(Code::DeadlineExceeded, self.to_string()),
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::ShardNotFound(_) | Error::UnknownServer(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) | Error::Rejected(_) => StatusCode::BAD_REQUEST,
            Error::MembershipConflict { .. } => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoQuorum(_)
            | Error::NotReady
            | Error::ShuttingDown
            | Error::Unreachable { .. }
            | Error::PartialWrite(_)
            | Error::PartialQuery(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_write_message_names_failed_owner() {
        let report = ShardWriteReport {
            shard_id: 7,
            sequence: 3,
            succeeded: vec![ServerId(1)],
            failed: vec![(ServerId(2), "connection refused".into())],
        };
        let err = Error::PartialWrite(vec![report]);
        let msg = err.to_string();
        assert!(msg.contains("shard 7"));
        assert!(msg.contains("server-2"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_conversions_keep_the_failure_kind() {
        let err: Error = config::ConfigError::Message("bad port".into()).into();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(err.to_http_status(), axum::http::StatusCode::BAD_REQUEST);

        let err: Error = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::NoQuorum("x".into()).to_grpc_status().code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            Error::MembershipConflict {
                raft_name: "a".into(),
                existing: "b".into()
            }
            .to_http_status(),
            axum::http::StatusCode::CONFLICT
        );
    }
}
