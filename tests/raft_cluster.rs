//! Raft integration test: three in-process nodes over the real transport

mod common;

use chronodb::cluster::{ClusterCommand, CommandResponse, ShardDefinition};
use chronodb::common::timestamp_now_millis;
use chronodb::storage::{Point, ShardQuery, WritePayload};
use common::{eventually, leader_of, start, test_config, wait_for_servers};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn three_nodes(dirs: &[TempDir; 3], replication_factor: usize) -> Vec<Arc<chronodb::Node>> {
    let mut first = test_config(dirs[0].path(), Vec::new());
    first.replication_factor = replication_factor;
    let seed = first.raft_connection_string();
    let mut nodes = vec![start(first).await];
    for dir in &dirs[1..] {
        let mut config = test_config(dir.path(), vec![seed.clone()]);
        config.replication_factor = replication_factor;
        nodes.push(start(config).await);
    }
    wait_for_servers(&nodes, 3).await;
    nodes
}

async fn stop_all(nodes: &[Arc<chronodb::Node>]) {
    for node in nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raft_cluster_forms_and_agrees() {
    let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap()];
    let nodes = three_nodes(&dirs, 1).await;

    // every server got a distinct id
    let mut ids: Vec<_> = nodes.iter().map(|n| n.server_id().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    assert!(eventually(Duration::from_secs(10), || leader_of(&nodes).is_some()).await);
    let leader = leader_of(&nodes).expect("no leader elected");

    // a proposal made on a follower is forwarded to the leader and applied everywhere
    let follower = nodes
        .iter()
        .find(|n| n.server_id() != leader.server_id())
        .and_then(|n| n.consensus())
        .unwrap();
    let response = follower
        .propose(ClusterCommand::CreateShard {
            definition: ShardDefinition {
                start_time: 0,
                end_time: 1_000,
                replication_factor: 2,
            },
        })
        .await
        .unwrap();
    let CommandResponse::ShardCreated { shard_id, created } = response else {
        panic!("unexpected response {:?}", response);
    };
    assert!(created);

    let agreed = eventually(Duration::from_secs(10), || {
        let reference = nodes[0].cluster().snapshot();
        nodes.iter().all(|n| {
            let snapshot = n.cluster().snapshot();
            snapshot.shard(shard_id).is_some()
                && snapshot.servers == reference.servers
                && snapshot.shards == reference.shards
        })
    })
    .await;
    assert!(agreed, "nodes disagree on the configuration");
    assert_eq!(nodes[1].cluster().shard(shard_id).unwrap().owners.len(), 2);

    stop_all(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raft_cluster_replicates_writes_to_owners() {
    let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap()];
    let nodes = three_nodes(&dirs, 3).await;

    // older than any pre-created shard, so it is created with all three servers present
    let now = timestamp_now_millis() - 48 * 3_600_000;
    let connected = eventually(Duration::from_secs(10), || {
        nodes
            .iter()
            .all(|n| n.status().connected_peers.len() == 2)
    })
    .await;
    assert!(connected, "peers not connected");

    // coordinated by a follower
    let reports = nodes[1]
        .write(WritePayload::new(
            (0..20).map(|i| Point::new("cpu", now + i)).collect(),
        ))
        .await
        .unwrap();
    for report in &reports {
        assert!(report.is_complete());
        assert_eq!(report.succeeded.len(), 3);
    }

    // every owner holds the data, so any node answers locally
    for node in &nodes {
        let shard = node.cluster().shard_for_timestamp(now).unwrap();
        assert!(shard.is_local(node.server_id().unwrap()));
        let points = node
            .query(ShardQuery::range(now, now + 20).series("cpu"))
            .await
            .unwrap();
        assert_eq!(points.len(), 20);
    }

    stop_all(&nodes).await;
}
