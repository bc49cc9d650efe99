//! Background WAL compaction
//!
//! Each pass reads a shard's committed watermark, flushes the shard store so
//! every entry at or below it is durable, then lets the WAL drop whole segments
//! through that point.
//!
//! Under [`WalSyncPolicy::Interval`] the same task also fsyncs the WAL every
//! [`WAL_SYNC_INTERVAL`].

use crate::common::{Result, WalSyncPolicy};
use crate::storage::shard::ShardStore;
use crate::storage::wal::WriteAheadLog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const WAL_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct CompactionManager {
    wal: Arc<WriteAheadLog>,
    store: Arc<ShardStore>,
    interval: Duration,
}

impl CompactionManager {
    pub fn new(wal: Arc<WriteAheadLog>, store: Arc<ShardStore>, interval: Duration) -> Self {
        Self {
            wal,
            store,
            interval,
        }
    }

    /// Compact every shard once. Returns the number of segments removed.
    pub fn run_once(&self) -> Result<usize> {
        let mut removed = 0;
        for shard_id in self.wal.shard_ids() {
            let Some(watermark) = self.wal.committed_watermark(shard_id) else {
                continue;
            };
            if watermark == 0 {
                continue;
            }
            self.store.flush(shard_id)?;
            removed += self.wal.compact(shard_id, watermark)?;
        }
        Ok(removed)
    }

    /// Fsync the WAL if its policy leaves syncing to this task.
    pub fn sync_once(&self) -> Result<usize> {
        if self.wal.sync_policy() != WalSyncPolicy::Interval {
            return Ok(0);
        }
        self.wal.sync()
    }

    /// Run until `shutdown` flips to true.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            let mut sync_ticker = tokio::time::interval(WAL_SYNC_INTERVAL);
            sync_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let compact = tokio::select! {
                    _ = ticker.tick() => true,
                    _ = sync_ticker.tick() => false,
                    _ = shutdown.changed() => break,
                };
                if *shutdown.borrow() {
                    break;
                }

                if !compact {
                    let manager = self.clone();
                    match tokio::task::spawn_blocking(move || manager.sync_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!("WAL sync failed: {}", e),
                        Err(e) => tracing::error!("WAL sync task panicked: {}", e),
                    }
                    continue;
                }

                let manager = self.clone();
                match tokio::task::spawn_blocking(move || manager.run_once()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => tracing::info!("WAL compaction removed {} segments", removed),
                    Ok(Err(e)) => tracing::warn!("WAL compaction failed: {}", e),
                    Err(e) => tracing::error!("WAL compaction task panicked: {}", e),
                }
            }
            tracing::debug!("WAL compaction loop stopped");
        })
    }
}
