//! Integration tests for a single chronodb node

mod common;

use chronodb::common::timestamp_now_millis;
use chronodb::node::LifecycleState;
use chronodb::storage::{FieldValue, Point, ShardQuery, WritePayload};
use chronodb::{Error, Node};
use common::{eventually, free_addr, start, test_config};
use std::time::Duration;
use tempfile::TempDir;

const HOUR_MS: i64 = 3_600_000;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bootstrap_creates_future_shards() {
    let dir = TempDir::new().unwrap();
    let node = start(test_config(dir.path(), Vec::new())).await;
    assert_eq!(node.state(), LifecycleState::Running);

    let snapshot = node.cluster().snapshot();
    assert_eq!(snapshot.servers.len(), 1);
    let server_id = node.server_id().unwrap();

    let now = timestamp_now_millis();
    let covered = eventually(Duration::from_secs(10), || {
        let snapshot = node.cluster().snapshot();
        snapshot.shard_for_timestamp(now).is_some()
            && snapshot.shard_for_timestamp(now + 30 * 60 * 1000).is_some()
    })
    .await;
    assert!(covered, "future shards were not created");

    let shard = node.cluster().shard_for_timestamp(now).unwrap();
    assert_eq!(shard.end_time - shard.start_time, HOUR_MS);
    assert_eq!(shard.owners, vec![server_id]);
    assert!(node.store().is_open(shard.id));

    node.stop().await.unwrap();
    assert_eq!(node.state(), LifecycleState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_and_query() {
    let dir = TempDir::new().unwrap();
    let node = start(test_config(dir.path(), Vec::new())).await;

    let base = timestamp_now_millis();
    let points: Vec<Point> = (0..5)
        .map(|i| Point::new("cpu", base + i).with_field("value", FieldValue::Float(i as f64)))
        .chain((0..3).map(|i| Point::new("mem", base + i)))
        .collect();
    let reports = node.write(WritePayload::new(points)).await.unwrap();
    assert!(reports.iter().all(|r| r.is_complete()));

    let cpu = node
        .query(ShardQuery::range(base, base + 10).series("cpu"))
        .await
        .unwrap();
    assert_eq!(cpu.len(), 5);
    assert!(cpu.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(cpu[2].fields.get("value"), Some(&FieldValue::Float(2.0)));

    let limited = node
        .query(ShardQuery::range(base, base + 10).limit(4))
        .await
        .unwrap();
    assert_eq!(limited.len(), 4);

    // writes far in the past get a shard of their own on demand
    let old = base - 48 * HOUR_MS;
    node.write(WritePayload::new(vec![Point::new("cpu", old)]))
        .await
        .unwrap();
    assert!(node.cluster().shard_for_timestamp(old).is_some());

    node.stop().await.unwrap();
    assert!(matches!(
        node.write(WritePayload::new(vec![Point::new("cpu", base)])).await,
        Err(Error::ShuttingDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_traffic_is_gated_on_lifecycle() {
    let dir = TempDir::new().unwrap();
    // the only seed never answers, so the node stays in startup waiting for membership
    let seed = format!("http://{}", free_addr());
    let node = Node::new(test_config(dir.path(), vec![seed])).unwrap();
    let point = || WritePayload::new(vec![Point::new("cpu", timestamp_now_millis())]);

    assert_eq!(node.state(), LifecycleState::Starting);
    assert!(matches!(node.write(point()).await, Err(Error::NotReady)));

    let starting = node.clone();
    let serve = tokio::spawn(async move { starting.listen_and_serve().await });
    assert!(eventually(Duration::from_secs(10), || node.consensus().is_some()).await);

    assert_eq!(node.state(), LifecycleState::Starting);
    assert!(matches!(node.write(point()).await, Err(Error::NotReady)));
    assert!(matches!(node.write_to_shard(1, point()).await, Err(Error::NotReady)));
    assert!(matches!(
        node.query(ShardQuery::range(0, i64::MAX)).await,
        Err(Error::NotReady)
    ));
    assert!(node.wal().server_id().is_none());

    node.stop().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), serve)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::ShuttingDown)));
    assert_eq!(node.state(), LifecycleState::Stopped);

    assert!(matches!(node.write(point()).await, Err(Error::ShuttingDown)));
    assert!(matches!(
        node.query(ShardQuery::range(0, i64::MAX)).await,
        Err(Error::ShuttingDown)
    ));
    // not restartable
    assert!(node.listen_and_serve().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_api() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), Vec::new());
    config.status_bind = Some("127.0.0.1:0".parse().unwrap());
    let node = start(config).await;
    let base = format!("http://{}", node.status_addr().unwrap());

    let health = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert!(health.status().is_success());

    let status: serde_json::Value = reqwest::get(format!("{}/status", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "running");
    assert_eq!(status["raft_role"], "leader");
    assert_eq!(status["servers"], 1);

    let servers: serde_json::Value = reqwest::get(format!("{}/cluster/servers", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(servers.as_array().unwrap().len(), 1);

    let metrics = reqwest::get(format!("{}/metrics", base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("raft_term"));

    node.stop().await.unwrap();
}
