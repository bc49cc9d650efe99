//! Durable consensus state using RocksDB
//!
//! Stores:
//! - Log entries (index → entry)
//! - Hard state (term, vote, commit) and the local raft name
//! - The latest snapshot of the cluster configuration
//!
//! Every write is synced before it returns.

use crate::common::{Error, Result};
use crate::consensus::messages::LogEntry;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CF_ENTRIES: &str = "entries";
const CF_STATE: &str = "state";
const CF_SNAPSHOT: &str = "snapshot";

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_RAFT_NAME: &[u8] = b"raft_name";
const KEY_SNAPSHOT: &[u8] = b"latest";

/// State that must survive a restart before a node may answer votes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<String>,
    pub commit: u64,
}

/// Encoded cluster state as of a log index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

pub struct RaftStorage {
    db: DB,
}

fn entry_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn synced() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl RaftStorage {
    /// Open or create the consensus database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, [CF_ENTRIES, CF_STATE, CF_SNAPSHOT])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    // === Identity and hard state ===

    pub fn raft_name(&self) -> Result<Option<String>> {
        let cf = self.cf(CF_STATE)?;
        match self.db.get_cf(cf, KEY_RAFT_NAME)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::Corrupted("raft name is not UTF-8".into())),
            None => Ok(None),
        }
    }

    pub fn set_raft_name(&self, name: &str) -> Result<()> {
        let cf = self.cf(CF_STATE)?;
        self.db.put_cf_opt(cf, KEY_RAFT_NAME, name.as_bytes(), &synced())?;
        Ok(())
    }

    pub fn load_hard_state(&self) -> Result<HardState> {
        let cf = self.cf(CF_STATE)?;
        match self.db.get_cf(cf, KEY_HARD_STATE)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::Corrupted(format!("hard state: {}", e))),
            None => Ok(HardState::default()),
        }
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let cf = self.cf(CF_STATE)?;
        self.db
            .put_cf_opt(cf, KEY_HARD_STATE, bincode::serialize(state)?, &synced())?;
        Ok(())
    }

    // === Log entries ===

    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, entry_key(entry.index), bincode::serialize(entry)?);
        }
        self.db.write_opt(batch, &synced())?;
        Ok(())
    }

    /// Delete every entry with index >= `index`
    pub fn truncate_from(&self, index: u64) -> Result<()> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, entry_key(index), entry_key(u64::MAX));
        self.db.write_opt(batch, &synced())?;
        Ok(())
    }

    /// All stored entries in index order
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let entry: LogEntry = bincode::deserialize(&value)
                .map_err(|e| Error::Corrupted(format!("log entry: {}", e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // === Snapshot ===

    /// Store `snapshot` and delete the log prefix it covers
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let snapshots = self.cf(CF_SNAPSHOT)?;
        let entries = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(snapshots, KEY_SNAPSHOT, bincode::serialize(snapshot)?);
        batch.delete_range_cf(entries, entry_key(0), entry_key(snapshot.index + 1));
        self.db.write_opt(batch, &synced())?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        let cf = self.cf(CF_SNAPSHOT)?;
        match self.db.get_cf(cf, KEY_SNAPSHOT)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| Error::Corrupted(format!("snapshot: {}", e))),
            None => Ok(None),
        }
    }
}
