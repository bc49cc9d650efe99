//! In-memory view of the replicated log, written through to [`RaftStorage`]

use crate::common::{Error, Result};
use crate::consensus::messages::LogEntry;
use crate::consensus::storage::{RaftStorage, Snapshot};
use std::sync::Arc;

/// Log entries after the latest snapshot. Index 0 is the empty log.
pub struct RaftLog {
    /// `entries[i].index == snapshot_index + 1 + i`
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    storage: Arc<RaftStorage>,
}

impl RaftLog {
    /// Load the persisted log
    pub fn load(storage: Arc<RaftStorage>) -> Result<Self> {
        let (snapshot_index, snapshot_term) = storage
            .load_snapshot()?
            .map(|s| (s.index, s.term))
            .unwrap_or((0, 0));

        let mut entries = Vec::new();
        for entry in storage.entries()? {
            if entry.index <= snapshot_index {
                continue;
            }
            let expected = snapshot_index + 1 + entries.len() as u64;
            if entry.index != expected {
                return Err(Error::Corrupted(format!(
                    "raft log gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
            entries.push(entry);
        }

        Ok(Self {
            entries,
            snapshot_index,
            snapshot_term,
            storage,
        })
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`; `None` if compacted away or not yet written
    pub fn term(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        if index <= self.snapshot_index || index > self.last_index() {
            return Vec::new();
        }
        let start = (index - self.snapshot_index - 1) as usize;
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// First index of the run of entries with `term` that ends at `index`
    pub fn first_index_of_term(&self, index: u64, term: u64) -> u64 {
        let mut first = index;
        while first > self.snapshot_index + 1 && self.term(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index != self.last_index() + 1 {
            return Err(Error::Raft(format!(
                "append at index {} does not follow last index {}",
                first.index,
                self.last_index()
            )));
        }
        self.storage.append(&entries)?;
        self.entries.extend(entries);
        Ok(())
    }

    /// Drop every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.snapshot_index {
            return Err(Error::Raft(format!(
                "cannot truncate at {} inside snapshot {}",
                index, self.snapshot_index
            )));
        }
        self.storage.truncate_from(index)?;
        self.entries.truncate((index - self.snapshot_index - 1) as usize);
        Ok(())
    }

    /// Persist `snapshot` and drop the entries it covers.
    ///
    /// Entries after the snapshot are kept only if the log agrees with it at the
    /// snapshot index; otherwise the whole log is replaced.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.index <= self.snapshot_index {
            return Ok(());
        }
        let keep_suffix = self.term(snapshot.index) == Some(snapshot.term);
        self.storage.save_snapshot(snapshot)?;
        if keep_suffix {
            let covered = (snapshot.index - self.snapshot_index) as usize;
            self.entries.drain(..covered);
        } else {
            self.storage.truncate_from(snapshot.index + 1)?;
            self.entries.clear();
        }
        self.snapshot_index = snapshot.index;
        self.snapshot_term = snapshot.term;
        Ok(())
    }
}
