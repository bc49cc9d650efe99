//! Cluster configuration
//!
//! The node-local view of the replicated [`ClusterState`]. It is mutated only by
//! the consensus apply loop; readers take `Arc<ClusterState>` snapshots and may
//! wait on the version channel for changes.

use crate::cluster::command::{ClusterCommand, ClusterEvent, CommandResponse};
use crate::cluster::types::{ClusterServer, ClusterState, ServerId, Shard, ShardDefinition, ShardId};
use crate::common::{timestamp_now_millis, Config, Error, Result, METRICS};
use crate::storage::{ShardStore, WriteAheadLog};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Creates shards through consensus
#[tonic::async_trait]
pub trait ShardCreator: Send + Sync {
    /// Propose a shard and return its id once the creation has applied locally.
    async fn create_shard(&self, definition: ShardDefinition) -> Result<ShardId>;
}

pub struct ClusterConfiguration {
    state: RwLock<Arc<ClusterState>>,
    version: watch::Sender<u64>,
    local_raft_name: RwLock<Option<String>>,
    shard_creator: RwLock<Option<Weak<dyn ShardCreator>>>,
    wal: Arc<WriteAheadLog>,
    store: Arc<ShardStore>,
    replication_factor: usize,
    shard_duration_ms: i64,
    shard_lookahead_ms: i64,
    shard_check_interval: Duration,
}

impl ClusterConfiguration {
    pub fn new(config: &Config, wal: Arc<WriteAheadLog>, store: Arc<ShardStore>) -> Result<Self> {
        let (version, _) = watch::channel(0);
        Ok(Self {
            state: RwLock::new(Arc::new(ClusterState::default())),
            version,
            local_raft_name: RwLock::new(None),
            shard_creator: RwLock::new(None),
            wal,
            store,
            replication_factor: config.replication_factor,
            shard_duration_ms: config.shard_duration_ms()?,
            shard_lookahead_ms: config.shard_lookahead_ms()?,
            shard_check_interval: config.shard_check_interval()?,
        })
    }

    /// Consistent snapshot of the applied state
    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.state.read().clone()
    }

    /// Version channel, bumped after every apply or restore
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn set_local_raft_name(&self, raft_name: impl Into<String>) {
        *self.local_raft_name.write() = Some(raft_name.into());
    }

    pub fn local_raft_name(&self) -> Option<String> {
        self.local_raft_name.read().clone()
    }

    /// Late-bind the component that turns shard definitions into committed shards.
    pub fn set_shard_creator(&self, creator: Weak<dyn ShardCreator>) {
        *self.shard_creator.write() = Some(creator);
    }

    fn shard_creator(&self) -> Result<Arc<dyn ShardCreator>> {
        self.shard_creator
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::NotReady)
    }

    /// This node's id, once its registration has applied
    pub fn server_id(&self) -> Option<ServerId> {
        self.local_server().map(|s| s.id)
    }

    pub fn local_server(&self) -> Option<ClusterServer> {
        let name = self.local_raft_name.read().clone()?;
        self.snapshot().server_by_name(&name).cloned()
    }

    /// Block until this node's own registration has been replicated and applied.
    pub async fn wait_for_local_server_loaded(&self) -> ServerId {
        let mut version = self.subscribe();
        loop {
            if let Some(id) = self.server_id() {
                return id;
            }
            if version.changed().await.is_err() {
                // sender lives as long as self, so this only happens during teardown
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    /// Decode and apply a committed consensus log entry.
    pub fn apply_entry(
        &self,
        index: u64,
        data: &[u8],
    ) -> Result<(CommandResponse, Vec<ClusterEvent>)> {
        let command: ClusterCommand = bincode::deserialize(data)
            .map_err(|e| Error::Corrupted(format!("log entry {}: {}", index, e)))?;
        Ok(self.apply_command(index, &command))
    }

    /// Apply a committed command. Only the consensus apply loop calls this.
    pub fn apply_command(
        &self,
        index: u64,
        command: &ClusterCommand,
    ) -> (CommandResponse, Vec<ClusterEvent>) {
        let (response, events) = {
            let mut guard = self.state.write();
            let mut next = ClusterState::clone(&guard);
            let result = next.apply(index, command);
            *guard = Arc::new(next);
            result
        };

        if let CommandResponse::Rejected(rejection) = &response {
            tracing::warn!(
                "Command {} at index {} rejected: {:?}",
                command.name(),
                index,
                rejection
            );
        }
        for event in &events {
            self.handle_event(event);
        }
        self.publish();
        (response, events)
    }

    /// Replace the whole state from a consensus snapshot.
    pub fn restore(&self, state: ClusterState) {
        tracing::info!(
            "Restoring cluster configuration at index {} ({} servers, {} shards)",
            state.applied_index,
            state.servers.len(),
            state.shards.len()
        );
        *self.state.write() = Arc::new(state);
        self.open_local_shards();
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        METRICS.cluster_servers.set(snapshot.servers.len() as u64);
        METRICS.cluster_shards.set(snapshot.shards.len() as u64);
        self.version.send_modify(|v| *v += 1);
    }

    /// Open the shard store for every locally owned shard.
    pub fn open_local_shards(&self) {
        let Some(local) = self.server_id() else {
            return;
        };
        for shard in self.snapshot().local_shards(local) {
            if let Err(e) = self.store.open(shard.id) {
                tracing::error!("Failed to open local shard {}: {}", shard.id, e);
            }
        }
    }

    fn handle_event(&self, event: &ClusterEvent) {
        let local = self.server_id();
        match event {
            ClusterEvent::ShardCreated(shard) => {
                tracing::info!(
                    "Shard {} created for [{}, {}) owned by {:?}",
                    shard.id,
                    shard.start_time,
                    shard.end_time,
                    shard.owners
                );
                if local.map_or(false, |id| shard.is_local(id)) {
                    if let Err(e) = self.store.open(shard.id) {
                        tracing::error!("Failed to open new local shard {}: {}", shard.id, e);
                    }
                }
            }
            ClusterEvent::ShardOwnersChanged { after, .. } => {
                if local.map_or(false, |id| after.is_local(id)) {
                    if let Err(e) = self.store.open(after.id) {
                        tracing::error!("Failed to open reassigned shard {}: {}", after.id, e);
                    }
                }
            }
            ClusterEvent::ShardDropped(shard) => {
                if let Err(e) = self.store.delete_shard(shard.id) {
                    tracing::error!("Failed to delete data of dropped shard {}: {}", shard.id, e);
                }
                if self.wal.server_id().is_some() {
                    if let Err(e) = self.wal.drop_shard(shard.id) {
                        tracing::error!("Failed to drop WAL of shard {}: {}", shard.id, e);
                    }
                }
            }
            ClusterEvent::ServerUpserted(server) => {
                tracing::info!(
                    "Server {} ({}) at {} [{}]",
                    server.id,
                    server.raft_name,
                    server.connection,
                    server.role
                );
            }
            ClusterEvent::ServerRemoved(id) => tracing::info!("Server {} removed", id),
        }
    }

    pub fn shard(&self, shard_id: ShardId) -> Option<Shard> {
        self.snapshot().shard(shard_id).cloned()
    }

    pub fn shard_for_timestamp(&self, timestamp: i64) -> Option<Shard> {
        self.snapshot().shard_for_timestamp(timestamp).cloned()
    }

    pub fn shards_overlapping(&self, start: i64, end: i64) -> Vec<Shard> {
        self.snapshot()
            .shards_overlapping(start, end)
            .into_iter()
            .cloned()
            .collect()
    }

    /// The shard-duration bucket containing `timestamp`. Buckets that would reach
    /// past the `i64` range are rejected.
    pub fn bucket_for(&self, timestamp: i64) -> Result<ShardDefinition> {
        let start = timestamp
            .div_euclid(self.shard_duration_ms)
            .checked_mul(self.shard_duration_ms);
        let bounds = start.and_then(|start| {
            start
                .checked_add(self.shard_duration_ms)
                .map(|end| (start, end))
        });
        let Some((start_time, end_time)) = bounds else {
            return Err(Error::Rejected(format!(
                "timestamp {} has no representable shard",
                timestamp
            )));
        };
        Ok(ShardDefinition {
            start_time,
            end_time,
            replication_factor: self.replication_factor,
        })
    }

    /// Return the shard covering `timestamp`, creating it through consensus if needed.
    pub async fn get_or_create_shard_for_timestamp(&self, timestamp: i64) -> Result<Shard> {
        if let Some(shard) = self.shard_for_timestamp(timestamp) {
            return Ok(shard);
        }

        let definition = self.bucket_for(timestamp)?;
        tracing::debug!(
            "No shard covers {}, creating [{}, {})",
            timestamp,
            definition.start_time,
            definition.end_time
        );
        let creator = self.shard_creator()?;
        let shard_id = creator.create_shard(definition).await?;
        self.wait_for_shard(shard_id, Duration::from_secs(5)).await?;
        self.shard_for_timestamp(timestamp)
            .ok_or(Error::ShardNotFound(shard_id))
    }

    /// Wait until `shard_id` appears in the applied state.
    pub async fn wait_for_shard(&self, shard_id: ShardId, timeout: Duration) -> Result<Shard> {
        let mut version = self.subscribe();
        let wait = async {
            loop {
                if let Some(shard) = self.shard(shard_id) {
                    return Ok(shard);
                }
                if version.changed().await.is_err() {
                    return Err(Error::ShuttingDown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(format!("shard {} not applied", shard_id)))?
    }

    /// Replay durable but unapplied WAL entries into the shard store.
    ///
    /// Runs shard by shard in ascending sequence order and must finish before the
    /// node accepts writes. Any unreadable entry aborts recovery.
    pub fn recover_from_wal(&self) -> Result<usize> {
        let local = self
            .server_id()
            .ok_or_else(|| Error::Recovery("local server not registered yet".into()))?;
        let state = self.snapshot();
        let mut recovered = 0;

        for shard_id in self.wal.shard_ids() {
            let watermark = self.wal.committed_watermark(shard_id).unwrap_or(0);
            let pending = self.wal.uncommitted(shard_id);
            if pending.is_empty() {
                continue;
            }

            let Some(shard) = state.shard(shard_id) else {
                tracing::warn!(
                    "WAL has {} entries for unknown shard {}, discarding",
                    pending.len(),
                    shard_id
                );
                self.wal.drop_shard(shard_id)?;
                continue;
            };
            let owned = shard.is_local(local);
            if owned {
                self.store
                    .open(shard_id)
                    .map_err(|e| Error::Recovery(format!("opening shard {}: {}", shard_id, e)))?;
            } else {
                tracing::warn!(
                    "Skipping {} WAL entries of shard {} which {} no longer owns",
                    pending.len(),
                    shard_id,
                    local
                );
            }

            tracing::info!(
                "Recovering shard {} from WAL sequence {}",
                shard_id,
                watermark + 1
            );
            let mut last = watermark;
            for entry in self.wal.replay_from(shard_id, watermark + 1)? {
                let entry = entry.map_err(|e| {
                    Error::Recovery(format!("shard {} after sequence {}: {}", shard_id, last, e))
                })?;
                if entry.sequence <= last {
                    return Err(Error::Recovery(format!(
                        "shard {} sequence {} replayed after {}",
                        shard_id, entry.sequence, last
                    )));
                }
                last = entry.sequence;
                if owned {
                    self.store
                        .write(shard_id, entry.write_id(local), &entry.record.payload)
                        .map_err(|e| {
                            Error::Recovery(format!(
                                "applying shard {} sequence {}: {}",
                                shard_id, entry.sequence, e
                            ))
                        })?;
                    recovered += 1;
                }
                self.wal.commit(shard_id, entry.sequence)?;
            }
        }

        METRICS.wal_entries_recovered.add(recovered as u64);
        if recovered > 0 {
            tracing::info!("Recovered {} WAL entries", recovered);
        }
        Ok(recovered)
    }

    /// Ensure shards exist for `now` and `now + lookahead`. Returns the ids created.
    pub async fn create_future_shards(&self, now: i64) -> Result<Vec<ShardId>> {
        let mut created = Vec::new();
        if self.snapshot().servers.is_empty() {
            return Ok(created);
        }
        for timestamp in [now, now.saturating_add(self.shard_lookahead_ms)] {
            if self.shard_for_timestamp(timestamp).is_some() {
                continue;
            }
            let definition = self.bucket_for(timestamp)?;
            tracing::info!(
                "Pre-creating shard for [{}, {})",
                definition.start_time,
                definition.end_time
            );
            let creator = self.shard_creator()?;
            created.push(creator.create_shard(definition).await?);
        }
        Ok(created)
    }

    /// Periodically make sure upcoming time windows have shards before writes arrive.
    pub fn create_future_shards_automatically_before_time_comes(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.shard_check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.create_future_shards(timestamp_now_millis()).await {
                    tracing::warn!("Future shard check failed: {}", e);
                }
            }
            tracing::debug!("Future shard loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{ConnectionInfo, ServerRole};
    use crate::common::WalSyncPolicy;
    use crate::storage::{Point, ShardQuery, WalRecord, WritePayload};
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        cluster: Arc<ClusterConfiguration>,
        wal: Arc<WriteAheadLog>,
        store: Arc<ShardStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            shard_duration: "1h".into(),
            shard_lookahead: "30m".into(),
            ..Default::default()
        };
        let wal = Arc::new(WriteAheadLog::new(
            config.wal_dir(),
            WalSyncPolicy::Always,
            1 << 20,
        ));
        let store = Arc::new(ShardStore::new(config.shard_dir()).unwrap());
        let cluster = Arc::new(ClusterConfiguration::new(&config, wal.clone(), store.clone()).unwrap());
        cluster.set_local_raft_name("me");
        Fixture {
            _dir: dir,
            cluster,
            wal,
            store,
        }
    }

    fn register(cluster: &ClusterConfiguration, index: u64, name: &str) {
        cluster.apply_command(
            index,
            &ClusterCommand::RegisterServer {
                raft_name: name.into(),
                connection: ConnectionInfo::new("http://r", "http://p"),
                role: ServerRole::Voter,
            },
        );
    }

    /// Applies shard creation directly, the way a one-node consensus would.
    struct DirectCreator {
        cluster: Arc<ClusterConfiguration>,
        index: Mutex<u64>,
    }

    #[tonic::async_trait]
    impl ShardCreator for DirectCreator {
        async fn create_shard(&self, definition: ShardDefinition) -> Result<ShardId> {
            let index = {
                let mut index = self.index.lock();
                *index += 1;
                *index
            };
            match self
                .cluster
                .apply_command(index, &ClusterCommand::CreateShard { definition })
                .0
                .into_result()?
            {
                CommandResponse::ShardCreated { shard_id, .. } => Ok(shard_id),
                other => Err(Error::Internal(format!("unexpected {:?}", other))),
            }
        }
    }

    #[tokio::test]
    async fn test_wait_for_local_server_loaded() {
        let f = fixture();
        assert!(f.cluster.server_id().is_none());

        let cluster = f.cluster.clone();
        let waiter = tokio::spawn(async move { cluster.wait_for_local_server_loaded().await });
        register(&f.cluster, 1, "other");
        register(&f.cluster, 2, "me");

        let id = waiter.await.unwrap();
        assert_eq!(id, ServerId(2));
        assert_eq!(f.cluster.local_server().unwrap().raft_name, "me");
    }

    #[tokio::test]
    async fn test_future_shards_cover_now_and_lookahead() {
        let f = fixture();
        register(&f.cluster, 1, "me");
        let creator: Arc<dyn ShardCreator> = Arc::new(DirectCreator {
            cluster: f.cluster.clone(),
            index: Mutex::new(10),
        });
        f.cluster.set_shard_creator(Arc::downgrade(&creator));

        let hour = 3_600_000;
        let now = 5 * hour + 45 * 60_000;
        let created = f.cluster.create_future_shards(now).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(f.cluster.shard_for_timestamp(now).is_some());
        assert!(f.cluster.shard_for_timestamp(now + 30 * 60_000).is_some());
        // the local node owns both, so they are open
        for id in created {
            assert!(f.store.is_open(id));
        }

        // a second pass has nothing to do
        assert!(f.cluster.create_future_shards(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_at_the_edges_of_i64_are_rejected() {
        let f = fixture();
        register(&f.cluster, 1, "me");
        let creator: Arc<dyn ShardCreator> = Arc::new(DirectCreator {
            cluster: f.cluster.clone(),
            index: Mutex::new(10),
        });
        f.cluster.set_shard_creator(Arc::downgrade(&creator));

        for timestamp in [i64::MAX - 5, i64::MIN] {
            assert!(matches!(f.cluster.bucket_for(timestamp), Err(Error::Rejected(_))));
            assert!(matches!(
                f.cluster.get_or_create_shard_for_timestamp(timestamp).await,
                Err(Error::Rejected(_))
            ));
        }
        assert!(f.cluster.snapshot().shards.is_empty());

        // the last full bucket below the limit is still usable
        let hour = 3_600_000;
        let last_start = (i64::MAX / hour - 1) * hour;
        let shard = f
            .cluster
            .get_or_create_shard_for_timestamp(last_start)
            .await
            .unwrap();
        assert_eq!(shard.start_time, last_start);
        assert_eq!(shard.end_time, last_start + hour);
    }

    #[tokio::test]
    async fn test_get_or_create_without_creator_is_not_ready() {
        let f = fixture();
        register(&f.cluster, 1, "me");
        assert!(matches!(
            f.cluster.get_or_create_shard_for_timestamp(0).await,
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_recover_from_wal_applies_in_order() {
        let f = fixture();
        register(&f.cluster, 1, "me");
        f.cluster.apply_command(
            2,
            &ClusterCommand::CreateShard {
                definition: ShardDefinition {
                    start_time: 0,
                    end_time: 1000,
                    replication_factor: 1,
                },
            },
        );
        f.wal.set_server_id(ServerId(1)).unwrap();

        for ts in 0..10 {
            let payload = WritePayload::new(vec![Point::new("cpu", ts)]);
            f.wal.append_write(1, &WalRecord::local(payload)).unwrap();
        }
        assert_eq!(f.store.read(1, &ShardQuery::range(0, 1000)).unwrap().len(), 0);

        assert_eq!(f.cluster.recover_from_wal().unwrap(), 10);
        let points = f.store.read(1, &ShardQuery::range(0, 1000)).unwrap();
        assert_eq!(points.iter().map(|p| p.timestamp).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert!(f.wal.uncommitted(1).is_empty());

        // nothing left to do the second time
        assert_eq!(f.cluster.recover_from_wal().unwrap(), 0);
    }

    #[test]
    fn test_drop_shard_removes_local_data() {
        let f = fixture();
        register(&f.cluster, 1, "me");
        f.cluster.apply_command(
            2,
            &ClusterCommand::CreateShard {
                definition: ShardDefinition {
                    start_time: 0,
                    end_time: 1000,
                    replication_factor: 1,
                },
            },
        );
        assert!(f.store.is_open(1));
        f.cluster.apply_command(3, &ClusterCommand::DropShard { shard_id: 1 });
        assert!(!f.store.is_open(1));
        assert!(f.cluster.shard(1).is_none());
    }
}
