//! Stress test for chronodb storage: WAL append/replay and shard store throughput

use chronodb::cluster::ServerId;
use chronodb::common::WalSyncPolicy;
use chronodb::storage::{Point, ShardQuery, ShardStore, WalRecord, WriteAheadLog, WriteId, WritePayload};
use std::time::Instant;
use tempfile::TempDir;

#[test]
fn stress_wal_and_shard_store() {
    let dir = TempDir::new().unwrap();
    // small segments so the log rolls many times
    let wal = WriteAheadLog::new(dir.path().join("wal"), WalSyncPolicy::Never, 64 * 1024);
    wal.set_server_id(ServerId(1)).unwrap();
    let store = ShardStore::new(dir.path().join("shards")).unwrap();

    let shards = [1u64, 2, 3, 4];
    for shard in shards {
        store.open(shard).unwrap();
    }

    let n = 2_000i64;
    let start = Instant::now();
    for i in 0..n {
        let shard = shards[(i as usize) % shards.len()];
        let payload = WritePayload::new(vec![Point::new("load", i)]);
        let sequence = wal
            .append_write(shard, &WalRecord::local(payload.clone()))
            .unwrap();
        store
            .write(shard, WriteId::new(ServerId(1), sequence), &payload)
            .unwrap();
        wal.commit(shard, sequence).unwrap();
    }
    let write_time = start.elapsed();

    let start = Instant::now();
    let mut replayed = 0;
    for shard in shards {
        let mut last = 0;
        for entry in wal.replay_from(shard, 1).unwrap() {
            let entry = entry.unwrap();
            assert!(entry.sequence > last);
            last = entry.sequence;
            replayed += 1;
        }
        let points = store
            .read(shard, &ShardQuery::range(0, n).series("load"))
            .unwrap();
        assert_eq!(points.len() as i64, n / shards.len() as i64);
    }
    let read_time = start.elapsed();
    assert_eq!(replayed, n);

    println!("Write {} points: {:?}", n, write_time);
    println!("Replay and read {} points: {:?}", n, read_time);
    assert!(write_time.as_secs_f64() < 30.0, "Write too slow");
    assert!(read_time.as_secs_f64() < 30.0, "Read too slow");

    wal.close().unwrap();
    store.close().unwrap();
}
