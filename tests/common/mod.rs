//! Helpers shared by the in-process cluster tests

#![allow(dead_code)]

use chronodb::common::WalSyncPolicy;
use chronodb::{Config, Node};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Reserve an ephemeral loopback port.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn test_config(data_dir: &Path, seeds: Vec<String>) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        raft_bind: free_addr(),
        rpc_bind: free_addr(),
        seed_servers: seeds,
        rpc_timeout_ms: 500,
        replication_factor: 1,
        shard_duration: "1h".to_string(),
        shard_lookahead: "30m".to_string(),
        shard_check_interval: "200ms".to_string(),
        election_timeout_ms: 300,
        heartbeat_interval_ms: 50,
        proposal_timeout_ms: 2_000,
        wal_sync: WalSyncPolicy::Always,
        wal_segment_bytes: 1024 * 1024,
        ..Default::default()
    }
}

pub async fn start(config: Config) -> Arc<Node> {
    let node = Node::new(config).unwrap();
    tokio::time::timeout(Duration::from_secs(30), node.listen_and_serve())
        .await
        .expect("node did not start in time")
        .unwrap();
    node
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until every node has applied a configuration with `servers` members.
pub async fn wait_for_servers(nodes: &[Arc<Node>], servers: usize) {
    let converged = eventually(Duration::from_secs(20), || {
        nodes
            .iter()
            .all(|n| n.cluster().snapshot().servers.len() == servers)
    })
    .await;
    assert!(converged, "cluster did not converge to {} servers", servers);
}

pub fn leader_of(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    nodes
        .iter()
        .find(|n| n.consensus().map_or(false, |c| c.is_leader()))
        .cloned()
}
