//! Recovery test for chronodb: crash with unapplied WAL entries and restart

mod common;

use chronodb::common::{timestamp_now_millis, WalSyncPolicy};
use chronodb::storage::{Point, ShardQuery, WalRecord, WriteAheadLog, WritePayload};
use common::{free_addr, start, test_config};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_recovers_unapplied_wal_entries() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), Vec::new());

    let node = start(config.clone()).await;
    let server_id = node.server_id().unwrap();
    let now = timestamp_now_millis();
    node.write(WritePayload::new(vec![Point::new("cpu", now)]))
        .await
        .unwrap();
    let shard = node.cluster().shard_for_timestamp(now).unwrap();
    node.stop().await.unwrap();
    drop(node);

    // Simulate a crash between WAL append and apply: ten durable, uncommitted writes
    let sequences: Vec<u64> = {
        let wal = WriteAheadLog::new(config.wal_dir(), WalSyncPolicy::Always, 1024 * 1024);
        wal.set_server_id(server_id).unwrap();
        let sequences = (0..10)
            .map(|i| {
                let point = Point::new("recovered", shard.start_time + i);
                wal.append_write(shard.id, &WalRecord::local(WritePayload::new(vec![point])))
                    .unwrap()
            })
            .collect();
        wal.close().unwrap();
        sequences
    };
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    // Restart on new ports; the node corrects its own address before recovering
    let mut restarted = config.clone();
    restarted.raft_bind = free_addr();
    restarted.rpc_bind = free_addr();
    let node = start(restarted.clone()).await;
    assert_eq!(node.server_id(), Some(server_id));
    assert!(node.wal().uncommitted(shard.id).is_empty());
    assert_eq!(
        node.wal().committed_watermark(shard.id),
        sequences.last().copied()
    );

    let points = node
        .query(ShardQuery::range(shard.start_time, shard.end_time).series("recovered"))
        .await
        .unwrap();
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    let expected: Vec<i64> = (0..10).map(|i| shard.start_time + i).collect();
    assert_eq!(timestamps, expected);

    // the write accepted before the crash survived too
    let before = node
        .query(ShardQuery::range(now, now + 1).series("cpu"))
        .await
        .unwrap();
    assert_eq!(before.len(), 1);

    let me = node.cluster().local_server().unwrap();
    assert_eq!(
        me.connection.raft_connection_string,
        restarted.raft_connection_string()
    );
    assert_eq!(node.cluster().snapshot().servers.len(), 1);

    node.stop().await.unwrap();
}
