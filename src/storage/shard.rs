//! Shard store using RocksDB
//!
//! One database per shard under `<data_dir>/shards/<shard_id>`. Points are keyed
//! so that a range scan over one series returns them in timestamp order:
//!
//! ```text
//! series 0x00 timestamp(8, sign-flipped BE) server(4 BE) sequence(8 BE) index(4 BE)
//! ```
//!
//! The write identity is part of the key, so applying the same write twice
//! (a retried forward, or a WAL replay) rewrites the same keys.

use crate::common::{Error, Result};
use crate::storage::point::{FieldValue, Point, ShardQuery, WriteId, WritePayload};
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SERIES_SEPARATOR: u8 = 0x00;

/// Local shard data
pub struct ShardStore {
    root: PathBuf,
    shards: RwLock<HashMap<u64, Arc<DB>>>,
}

impl ShardStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            shards: RwLock::new(HashMap::new()),
        })
    }

    fn shard_path(&self, shard_id: u64) -> PathBuf {
        self.root.join(shard_id.to_string())
    }

    /// Open (or create) a shard. Opening an already open shard is a no-op.
    pub fn open(&self, shard_id: u64) -> Result<()> {
        if self.shards.read().contains_key(&shard_id) {
            return Ok(());
        }

        let mut shards = self.shards.write();
        if shards.contains_key(&shard_id) {
            return Ok(());
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, self.shard_path(shard_id))?;
        shards.insert(shard_id, Arc::new(db));
        tracing::debug!("Opened shard {}", shard_id);
        Ok(())
    }

    /// Shards present on disk, open or not
    pub fn shard_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn is_open(&self, shard_id: u64) -> bool {
        self.shards.read().contains_key(&shard_id)
    }

    fn db(&self, shard_id: u64) -> Result<Arc<DB>> {
        self.shards
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or(Error::ShardNotFound(shard_id))
    }

    /// Write all points of a payload atomically. Returns the number of points written.
    pub fn write(&self, shard_id: u64, write_id: WriteId, payload: &WritePayload) -> Result<usize> {
        let db = self.db(shard_id)?;
        let mut batch = WriteBatch::default();
        for (index, point) in payload.points.iter().enumerate() {
            if point.series.is_empty() || point.series.as_bytes().contains(&SERIES_SEPARATOR) {
                return Err(Error::Rejected(format!(
                    "invalid series name {:?}",
                    point.series
                )));
            }
            let key = encode_key(&point.series, point.timestamp, write_id, index as u32);
            batch.put(key, bincode::serialize(&point.fields)?);
        }
        db.write(batch)?;
        Ok(payload.points.len())
    }

    /// Read the points of one shard matching `query`, ordered by (series, timestamp).
    pub fn read(&self, shard_id: u64, query: &ShardQuery) -> Result<Vec<Point>> {
        let db = self.db(shard_id)?;
        let mut points = Vec::new();
        if query.start >= query.end {
            return Ok(points);
        }

        let bounds = query.series.as_ref().map(|series| {
            (
                series_prefix(series, query.start),
                series_prefix(series, query.end),
            )
        });
        let iter = match &bounds {
            Some((lower, _)) => db.iterator(IteratorMode::From(lower.as_slice(), Direction::Forward)),
            None => db.iterator(IteratorMode::Start),
        };

        for item in iter {
            let (key, value) = item?;
            if let Some((_, upper)) = &bounds {
                if &key[..] >= upper.as_slice() {
                    break;
                }
            }
            let (series, timestamp) = decode_key(&key)?;
            if timestamp < query.start || timestamp >= query.end {
                continue;
            }
            let fields: BTreeMap<String, FieldValue> = bincode::deserialize(&value)
                .map_err(|e| Error::Corrupted(format!("shard {} value: {}", shard_id, e)))?;
            points.push(Point {
                series,
                timestamp,
                fields,
            });
            if query.limit.map_or(false, |limit| points.len() >= limit) {
                break;
            }
        }

        Ok(points)
    }

    /// Flush a shard's memtable to disk.
    ///
    /// Everything written before this call is durable once it returns. A shard
    /// that is not open has nothing buffered.
    pub fn flush(&self, shard_id: u64) -> Result<()> {
        if let Ok(db) = self.db(shard_id) {
            db.flush()?;
        }
        Ok(())
    }

    /// Close a shard and delete its data.
    pub fn delete_shard(&self, shard_id: u64) -> Result<()> {
        let removed = self.shards.write().remove(&shard_id);
        drop(removed);

        let path = self.shard_path(shard_id);
        if path.exists() {
            DB::destroy(&Options::default(), &path)?;
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            tracing::info!("Deleted shard {} data", shard_id);
        }
        Ok(())
    }

    /// Flush and close every shard.
    pub fn close(&self) -> Result<()> {
        let shards: Vec<(u64, Arc<DB>)> = self.shards.write().drain().collect();
        let mut first_error = None;
        for (shard_id, db) in shards {
            if let Err(e) = db.flush() {
                tracing::error!("Failed to flush shard {}: {}", shard_id, e);
                first_error.get_or_insert(Error::from(e));
            }
        }
        tracing::info!("Shard store closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn encode_timestamp(timestamp: i64) -> [u8; 8] {
    ((timestamp as u64) ^ (1 << 63)).to_be_bytes()
}

fn series_prefix(series: &str, timestamp: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(series.len() + 9);
    key.extend_from_slice(series.as_bytes());
    key.push(SERIES_SEPARATOR);
    key.extend_from_slice(&encode_timestamp(timestamp));
    key
}

fn encode_key(series: &str, timestamp: i64, write_id: WriteId, index: u32) -> Vec<u8> {
    let mut key = series_prefix(series, timestamp);
    key.extend_from_slice(&write_id.server.0.to_be_bytes());
    key.extend_from_slice(&write_id.sequence.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn decode_key(key: &[u8]) -> Result<(String, i64)> {
    let sep = key
        .iter()
        .position(|b| *b == SERIES_SEPARATOR)
        .ok_or_else(|| Error::Corrupted("shard key without series separator".into()))?;
    let series = std::str::from_utf8(&key[..sep])
        .map_err(|_| Error::Corrupted("invalid UTF-8 in series".into()))?
        .to_string();
    let ts = key
        .get(sep + 1..sep + 9)
        .ok_or_else(|| Error::Corrupted("shard key too short".into()))?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(ts);
    let timestamp = (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64;
    Ok((series, timestamp))
}
