//! Local shard access for writes forwarded by other servers and for queries

use crate::cluster::{ClusterConfiguration, ShardId};
use crate::common::{Error, Result};
use crate::storage::{Point, ShardQuery, ShardStore, WalRecord, WriteAheadLog, WriteId, WritePayload};
use std::sync::Arc;
use std::time::Duration;

/// How long a forwarded write waits for a shard this node has not applied yet
const SHARD_APPLY_WAIT: Duration = Duration::from_secs(2);

pub struct LocalShards {
    wal: Arc<WriteAheadLog>,
    store: Arc<ShardStore>,
    cluster: Arc<ClusterConfiguration>,
}

impl LocalShards {
    pub fn new(
        wal: Arc<WriteAheadLog>,
        store: Arc<ShardStore>,
        cluster: Arc<ClusterConfiguration>,
    ) -> Self {
        Self {
            wal,
            store,
            cluster,
        }
    }

    /// Apply a write coordinated elsewhere: log it under its origin, store it, commit.
    pub async fn apply_forwarded(
        &self,
        shard_id: ShardId,
        origin: WriteId,
        payload: WritePayload,
    ) -> Result<usize> {
        let shard = match self.cluster.shard(shard_id) {
            Some(shard) => shard,
            // the coordinator may have applied the shard creation before we did
            None => self.cluster.wait_for_shard(shard_id, SHARD_APPLY_WAIT).await?,
        };
        let local = self.cluster.server_id().ok_or(Error::NotReady)?;
        if !shard.is_local(local) {
            return Err(Error::Rejected(format!(
                "{} does not own shard {}",
                local, shard_id
            )));
        }

        self.store.open(shard_id)?;
        let record = WalRecord::forwarded(origin, payload);
        let sequence = self.wal.append_write(shard_id, &record)?;
        let written = self.store.write(shard_id, origin, &record.payload)?;
        self.wal.commit(shard_id, sequence)?;
        tracing::trace!(
            "Applied forwarded write {} to shard {} as sequence {}",
            origin,
            shard_id,
            sequence
        );
        Ok(written)
    }

    /// Apply a write this node already logged.
    pub fn apply_local(
        &self,
        shard_id: ShardId,
        write_id: WriteId,
        payload: &WritePayload,
    ) -> Result<usize> {
        self.store.open(shard_id)?;
        self.store.write(shard_id, write_id, payload)
    }

    pub fn query(&self, shard_id: ShardId, query: &ShardQuery) -> Result<Vec<Point>> {
        let local = self.cluster.server_id().ok_or(Error::NotReady)?;
        match self.cluster.shard(shard_id) {
            Some(shard) if shard.is_local(local) => {}
            Some(_) => {
                return Err(Error::Rejected(format!(
                    "{} does not own shard {}",
                    local, shard_id
                )))
            }
            None => return Err(Error::ShardNotFound(shard_id)),
        }
        self.store.open(shard_id)?;
        self.store.read(shard_id, query)
    }
}
