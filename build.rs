//! Generates the node-to-node gRPC services.
//!
//! Message types are hand-written prost structs in `src/proto.rs`, so no `protoc` is needed.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{}", input))
        .output_type(format!("crate::proto::{}", output))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let raft = Service::builder()
        .name("RaftTransport")
        .package("chronodb")
        .method(method("request_vote", "RequestVote", "VoteRequest", "VoteResponse"))
        .method(method(
            "append_entries",
            "AppendEntries",
            "AppendRequest",
            "AppendResponse",
        ))
        .method(method(
            "install_snapshot",
            "InstallSnapshot",
            "SnapshotRequest",
            "SnapshotResponse",
        ))
        .method(method("propose", "Propose", "ProposeRequest", "ProposeResponse"))
        .method(method("join", "Join", "JoinRequest", "JoinResponse"))
        .build();

    let shard = Service::builder()
        .name("ShardTransport")
        .package("chronodb")
        .method(method(
            "write_shard",
            "WriteShard",
            "WriteShardRequest",
            "WriteShardResponse",
        ))
        .method(method(
            "query_shard",
            "QueryShard",
            "QueryShardRequest",
            "QueryShardResponse",
        ))
        .build();

    Builder::new().compile(&[raft, shard]);

    println!("cargo:rerun-if-changed=build.rs");
}
