//! Write-Ahead Log (WAL) implementation
//!
//! Every accepted write is recorded here, durably, before it is applied to the
//! shard store. Sequence numbers are assigned per server and are never reused,
//! even across restarts and compaction.
//!
//! Layout:
//! ```text
//! <wal_dir>/<server_id>/bookmark.json
//! <wal_dir>/<server_id>/<shard_id>/<segment>.seg
//! ```
//!
//! The bookmark records the sequence floor and the committed watermark of each
//! shard. It is rewritten (temp file + rename) on compaction, shard drop and close.

use crate::cluster::ServerId;
use crate::common::{Error, Result, WalSyncPolicy, METRICS};
use crate::storage::point::{WriteId, WritePayload};
use crate::storage::segment::{SegmentIter, SegmentLog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

const BOOKMARK_FILE: &str = "bookmark.json";

/// What a WAL entry carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Set when the write was coordinated by another server and forwarded here
    pub origin: Option<WriteId>,
    pub payload: WritePayload,
}

impl WalRecord {
    pub fn local(payload: WritePayload) -> Self {
        Self {
            origin: None,
            payload,
        }
    }

    pub fn forwarded(origin: WriteId, payload: WritePayload) -> Self {
        Self {
            origin: Some(origin),
            payload,
        }
    }
}

/// A WAL entry read back during replay
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub sequence: u64,
    pub shard_id: u64,
    pub record: WalRecord,
}

impl WalEntry {
    /// The identity points of this entry are stored under.
    pub fn write_id(&self, local: ServerId) -> WriteId {
        self.record
            .origin
            .unwrap_or_else(|| WriteId::new(local, self.sequence))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Bookmark {
    /// Highest sequence ever handed out
    sequence_floor: u64,
    /// Committed watermark per shard
    watermarks: BTreeMap<u64, u64>,
}

struct ShardLog {
    log: SegmentLog,
    /// Watermark known before any sequence in `uncommitted` was appended
    floor: u64,
    uncommitted: BTreeSet<u64>,
}

impl ShardLog {
    fn watermark(&self) -> u64 {
        match self.uncommitted.iter().next() {
            Some(&first) => first.saturating_sub(1).max(self.floor),
            None => self.log.last_sequence().unwrap_or(0).max(self.floor),
        }
    }
}

struct WalState {
    server_id: ServerId,
    dir: PathBuf,
    next_sequence: u64,
    shards: BTreeMap<u64, ShardLog>,
}

/// Write-Ahead Log
///
/// Unusable until [`WriteAheadLog::set_server_id`] has been called, since the
/// directory and the sequence space belong to the server identity.
pub struct WriteAheadLog {
    root: PathBuf,
    sync_policy: WalSyncPolicy,
    segment_bytes: u64,
    state: Mutex<Option<WalState>>,
}

impl WriteAheadLog {
    pub fn new(root: impl AsRef<Path>, sync_policy: WalSyncPolicy, segment_bytes: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            sync_policy,
            segment_bytes,
            state: Mutex::new(None),
        }
    }

    /// Bind the log to this server's identity and open its existing shard logs.
    pub fn set_server_id(&self, server_id: ServerId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.as_ref() {
            if existing.server_id == server_id {
                return Ok(());
            }
            return Err(Error::Wal(format!(
                "WAL already bound to {}, refusing {}",
                existing.server_id, server_id
            )));
        }

        let dir = self.root.join(server_id.0.to_string());
        std::fs::create_dir_all(&dir)?;
        let bookmark = read_bookmark(&dir)?;

        let mut shards = BTreeMap::new();
        let mut highest = bookmark.sequence_floor;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(shard_id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };

            let floor = bookmark.watermarks.get(&shard_id).copied().unwrap_or(0);
            let mut log = SegmentLog::open(entry.path(), self.segment_bytes, self.sync_policy)?;
            let mut uncommitted = BTreeSet::new();
            for record in log.read_from(floor + 1)? {
                uncommitted.insert(record?.sequence);
            }
            highest = highest.max(log.last_sequence().unwrap_or(0));

            if !uncommitted.is_empty() {
                tracing::info!(
                    "WAL shard {} has {} uncommitted entries above {}",
                    shard_id,
                    uncommitted.len(),
                    floor
                );
            }
            shards.insert(
                shard_id,
                ShardLog {
                    log,
                    floor,
                    uncommitted,
                },
            );
        }

        tracing::info!(
            "WAL opened for {} at {} ({} shards, next sequence {})",
            server_id,
            dir.display(),
            shards.len(),
            highest + 1
        );
        *state = Some(WalState {
            server_id,
            dir,
            next_sequence: highest + 1,
            shards,
        });
        Ok(())
    }

    pub fn server_id(&self) -> Option<ServerId> {
        self.state.lock().as_ref().map(|s| s.server_id)
    }

    /// Durably append a write for `shard_id`, returning its sequence.
    ///
    /// Under [`WalSyncPolicy::Always`] the entry is fsynced before this returns.
    pub fn append_write(&self, shard_id: u64, record: &WalRecord) -> Result<u64> {
        let bytes = bincode::serialize(record)?;

        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(not_bound)?;
        let sequence = state.next_sequence;
        // consumed even if the append fails, so a sequence is never handed out twice
        state.next_sequence += 1;

        let shard = match state.shards.entry(shard_id) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                let log = SegmentLog::open(
                    state.dir.join(shard_id.to_string()),
                    self.segment_bytes,
                    self.sync_policy,
                )?;
                e.insert(ShardLog {
                    log,
                    floor: 0,
                    uncommitted: BTreeSet::new(),
                })
            }
        };

        let written = shard.log.append(sequence, &bytes).map_err(|e| {
            tracing::error!("WAL append for shard {} failed: {}", shard_id, e);
            e
        })?;
        shard.uncommitted.insert(sequence);

        METRICS.wal_appends.inc();
        METRICS.wal_bytes_appended.add(written);
        Ok(sequence)
    }

    /// Mark an entry as applied to the shard store. Committing twice is a no-op.
    pub fn commit(&self, shard_id: u64, sequence: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(not_bound)?;
        let shard = state
            .shards
            .get_mut(&shard_id)
            .ok_or_else(|| Error::Wal(format!("no WAL for shard {}", shard_id)))?;
        if shard.uncommitted.remove(&sequence) {
            METRICS.wal_commits.inc();
        }
        Ok(())
    }

    /// Entries of `shard_id` with sequence >= `sequence`, ascending.
    pub fn replay_from(&self, shard_id: u64, sequence: u64) -> Result<WalReplay> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(not_bound)?;
        let inner = match state.shards.get_mut(&shard_id) {
            Some(shard) => Some(shard.log.read_from(sequence)?),
            None => None,
        };
        Ok(WalReplay { shard_id, inner })
    }

    /// Highest sequence such that every entry of `shard_id` at or below it is committed.
    pub fn committed_watermark(&self, shard_id: u64) -> Option<u64> {
        let guard = self.state.lock();
        guard
            .as_ref()
            .and_then(|s| s.shards.get(&shard_id))
            .map(ShardLog::watermark)
    }

    /// Uncommitted sequences of `shard_id`, ascending.
    pub fn uncommitted(&self, shard_id: u64) -> Vec<u64> {
        let guard = self.state.lock();
        guard
            .as_ref()
            .and_then(|s| s.shards.get(&shard_id))
            .map(|s| s.uncommitted.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        let guard = self.state.lock();
        guard
            .as_ref()
            .map(|s| s.shards.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Next sequence that will be handed out
    pub fn next_sequence(&self) -> Option<u64> {
        self.state.lock().as_ref().map(|s| s.next_sequence)
    }

    /// Delete whole segments that the shard store has durably applied.
    ///
    /// Only segments whose entries are all at or below both the committed watermark
    /// and `durable_through` are removed. Returns the number of segments deleted.
    pub fn compact(&self, shard_id: u64, durable_through: u64) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(not_bound)?;
        let Some(shard) = state.shards.get(&shard_id) else {
            return Ok(0);
        };
        let limit = shard.watermark().min(durable_through);

        // the floor must hit disk before the segments holding the highest sequences go
        write_bookmark(state)?;

        let shard = state
            .shards
            .get_mut(&shard_id)
            .ok_or_else(|| Error::Wal(format!("no WAL for shard {}", shard_id)))?;
        let removed = shard.log.remove_through(limit)?;
        if removed > 0 {
            tracing::debug!(
                "Compacted {} WAL segments of shard {} through sequence {}",
                removed,
                shard_id,
                limit
            );
            METRICS.wal_segments_removed.add(removed as u64);
        }
        Ok(removed)
    }

    /// Remove every entry of a dropped shard.
    pub fn drop_shard(&self, shard_id: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(not_bound)?;
        if let Some(shard) = state.shards.remove(&shard_id) {
            write_bookmark(state)?;
            shard.log.destroy()?;
            tracing::info!("Dropped WAL of shard {}", shard_id);
        }
        Ok(())
    }

    pub fn sync_policy(&self) -> WalSyncPolicy {
        self.sync_policy
    }

    /// Fsync every open shard log. Returns the number of logs synced.
    pub fn sync(&self) -> Result<usize> {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return Ok(0);
        };
        for shard in state.shards.values_mut() {
            shard.log.sync_all()?;
        }
        Ok(state.shards.len())
    }

    /// Sync every shard log and persist the bookmark. Further appends fail.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let Some(mut state) = guard.take() else {
            return Ok(());
        };
        for shard in state.shards.values_mut() {
            shard.log.sync_all()?;
        }
        write_bookmark(&state)?;
        tracing::info!("WAL closed at sequence {}", state.next_sequence - 1);
        Ok(())
    }
}

/// Iterator returned by [`WriteAheadLog::replay_from`]
pub struct WalReplay {
    shard_id: u64,
    inner: Option<SegmentIter>,
}

impl Iterator for WalReplay {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.inner.as_mut()?.next()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e)),
        };
        let decoded = bincode::deserialize::<WalRecord>(&record.payload).map_err(|e| {
            Error::Corrupted(format!(
                "undecodable WAL entry {} of shard {}: {}",
                record.sequence, self.shard_id, e
            ))
        });
        Some(decoded.map(|record_body| WalEntry {
            sequence: record.sequence,
            shard_id: self.shard_id,
            record: record_body,
        }))
    }
}

fn not_bound() -> Error {
    Error::Wal("WAL has no server id (closed or not yet started)".into())
}

fn read_bookmark(dir: &Path) -> Result<Bookmark> {
    let path = dir.join(BOOKMARK_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| Error::Corrupted(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Bookmark::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_bookmark(state: &WalState) -> Result<()> {
    let bookmark = Bookmark {
        sequence_floor: state.next_sequence.saturating_sub(1),
        watermarks: state
            .shards
            .iter()
            .map(|(id, shard)| (*id, shard.watermark()))
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&bookmark)?;

    let tmp = state.dir.join(format!("{}.tmp", BOOKMARK_FILE));
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, state.dir.join(BOOKMARK_FILE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::point::Point;
    use tempfile::tempdir;

    fn record(series: &str, ts: i64) -> WalRecord {
        WalRecord::local(WritePayload::new(vec![Point::new(series, ts)]))
    }

    fn open(dir: &Path, segment_bytes: u64) -> WriteAheadLog {
        let wal = WriteAheadLog::new(dir, WalSyncPolicy::Always, segment_bytes);
        wal.set_server_id(ServerId(1)).unwrap();
        wal
    }

    fn sequences(wal: &WriteAheadLog, shard: u64, from: u64) -> Vec<u64> {
        wal.replay_from(shard, from)
            .unwrap()
            .map(|e| e.unwrap().sequence)
            .collect()
    }

    #[test]
    fn test_append_requires_server_id() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::new(dir.path(), WalSyncPolicy::Always, 1 << 20);
        assert!(wal.append_write(1, &record("cpu", 1)).is_err());
    }

    #[test]
    fn test_sequences_are_per_server_and_increasing() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path(), 1 << 20);

        let a = wal.append_write(1, &record("cpu", 1)).unwrap();
        let b = wal.append_write(2, &record("mem", 1)).unwrap();
        let c = wal.append_write(1, &record("cpu", 2)).unwrap();
        assert!(a < b && b < c);

        assert_eq!(sequences(&wal, 1, 0), vec![a, c]);
        assert_eq!(sequences(&wal, 2, 0), vec![b]);
        assert_eq!(wal.shard_ids(), vec![1, 2]);
    }

    #[test]
    fn test_replay_from_yields_suffix_without_duplicates() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path(), 256);
        for ts in 0..20 {
            wal.append_write(7, &record("cpu", ts)).unwrap();
        }

        for n in [0, 1, 5, 13, 20, 21, 50] {
            let got = sequences(&wal, 7, n);
            let expected: Vec<u64> = (1..=20).filter(|s| *s >= n).collect();
            assert_eq!(got, expected, "replay_from({})", n);
        }

        let entry = wal.replay_from(7, 3).unwrap().next().unwrap().unwrap();
        assert_eq!(entry.shard_id, 7);
        assert_eq!(entry.record.payload.points[0].timestamp, 2);
        assert_eq!(entry.write_id(ServerId(1)), WriteId::new(ServerId(1), 3));
    }

    #[test]
    fn test_watermark_tracks_contiguous_commits() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path(), 1 << 20);
        let s1 = wal.append_write(1, &record("cpu", 1)).unwrap();
        let s2 = wal.append_write(1, &record("cpu", 2)).unwrap();
        let s3 = wal.append_write(1, &record("cpu", 3)).unwrap();

        assert_eq!(wal.committed_watermark(1), Some(0));
        wal.commit(1, s2).unwrap();
        assert_eq!(wal.committed_watermark(1), Some(0));
        wal.commit(1, s1).unwrap();
        assert_eq!(wal.committed_watermark(1), Some(s2));
        wal.commit(1, s3).unwrap();
        wal.commit(1, s3).unwrap();
        assert_eq!(wal.committed_watermark(1), Some(s3));
        assert!(wal.uncommitted(1).is_empty());
    }

    #[test]
    fn test_reopen_keeps_sequence_and_uncommitted_entries() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path(), 1 << 20);
            for ts in 0..5 {
                let seq = wal.append_write(3, &record("cpu", ts)).unwrap();
                if ts < 2 {
                    wal.commit(3, seq).unwrap();
                }
            }
            wal.close().unwrap();
            assert!(wal.append_write(3, &record("cpu", 9)).is_err());
        }

        let wal = open(dir.path(), 1 << 20);
        assert_eq!(wal.next_sequence(), Some(6));
        assert_eq!(wal.committed_watermark(3), Some(2));
        assert_eq!(wal.uncommitted(3), vec![3, 4, 5]);
        assert_eq!(wal.append_write(3, &record("cpu", 10)).unwrap(), 6);
    }

    #[test]
    fn test_compaction_never_passes_watermark() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path(), 128);
        let mut seqs = Vec::new();
        for ts in 0..10 {
            seqs.push(wal.append_write(1, &record("cpu", ts)).unwrap());
        }
        for seq in &seqs[..4] {
            wal.commit(1, *seq).unwrap();
        }

        wal.compact(1, u64::MAX).unwrap();
        let remaining = sequences(&wal, 1, 0);
        // every uncommitted entry survives
        for seq in &seqs[4..] {
            assert!(remaining.contains(seq));
        }

        // durable_through further limits what can go
        for seq in &seqs[4..] {
            wal.commit(1, *seq).unwrap();
        }
        wal.compact(1, 6).unwrap();
        let remaining = sequences(&wal, 1, 0);
        for seq in 7..=10 {
            assert!(remaining.contains(&seq));
        }
    }

    #[test]
    fn test_sequence_not_reused_after_compaction() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path(), 64);
            for ts in 0..6 {
                let seq = wal.append_write(1, &record("cpu", ts)).unwrap();
                wal.commit(1, seq).unwrap();
            }
            wal.drop_shard(1).unwrap();
        }

        let wal = open(dir.path(), 64);
        assert!(wal.shard_ids().is_empty());
        assert_eq!(wal.append_write(1, &record("cpu", 0)).unwrap(), 7);
    }
}
