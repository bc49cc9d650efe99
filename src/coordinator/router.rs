//! Shard routing and replication
//!
//! Every accepted write goes, per shard:
//! 1. into this server's WAL (its sequence becomes the write's identity)
//! 2. into the local shard store, if this server owns the shard
//! 3. to every remote owner, concurrently
//!
//! The WAL entry is committed once the local apply is done (or immediately when
//! this server is not an owner). Remote failures are reported, never retried here.

use crate::cluster::{ClusterConfiguration, Shard, ServerId, ShardId};
use crate::common::{Error, PartialQuery, Result, ShardWriteReport, METRICS};
use crate::coordinator::{Coordinator, LocalShards, PeerChange, ShardTarget};
use crate::rpc::{ConnectionFactory, ServerConnection};
use crate::storage::{merge_points, Point, ShardQuery, WalRecord, WriteAheadLog, WriteId, WritePayload};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

pub struct CoordinatorImpl {
    cluster: Arc<ClusterConfiguration>,
    wal: Arc<WriteAheadLog>,
    local: Arc<LocalShards>,
    factory: ConnectionFactory,
    connections: RwLock<HashMap<ServerId, Arc<dyn ServerConnection>>>,
    local_id: RwLock<Option<ServerId>>,
}

impl CoordinatorImpl {
    pub fn new(
        cluster: Arc<ClusterConfiguration>,
        wal: Arc<WriteAheadLog>,
        local: Arc<LocalShards>,
        factory: ConnectionFactory,
    ) -> Self {
        Self {
            cluster,
            wal,
            local,
            factory,
            connections: RwLock::new(HashMap::new()),
            local_id: RwLock::new(None),
        }
    }

    fn local_id(&self) -> Result<ServerId> {
        (*self.local_id.read()).ok_or(Error::NotReady)
    }

    /// Connected peers, for status output
    pub fn connected_peers(&self) -> Vec<ServerId> {
        let mut peers: Vec<ServerId> = self.connections.read().keys().copied().collect();
        peers.sort();
        peers
    }

    fn connection(&self, server_id: ServerId) -> Result<Arc<dyn ServerConnection>> {
        if let Some(conn) = self.connections.read().get(&server_id) {
            return Ok(conn.clone());
        }
        let snapshot = self.cluster.snapshot();
        let server = snapshot
            .server(server_id)
            .ok_or_else(|| Error::UnknownServer(server_id.to_string()))?;
        let conn = (self.factory)(server)?;
        self.connections.write().insert(server_id, conn.clone());
        Ok(conn)
    }

    /// Group points by the shard covering their timestamp, creating shards as needed.
    async fn group_by_time(&self, payload: WritePayload) -> Result<Vec<(Shard, WritePayload)>> {
        let mut groups: BTreeMap<ShardId, (Shard, WritePayload)> = BTreeMap::new();
        for point in payload.points {
            let cached = groups
                .values()
                .find(|(shard, _)| shard.covers(point.timestamp))
                .map(|(shard, _)| shard.id);
            let shard_id = match cached {
                Some(id) => id,
                None => {
                    let shard = self
                        .cluster
                        .get_or_create_shard_for_timestamp(point.timestamp)
                        .await?;
                    let id = shard.id;
                    groups
                        .entry(id)
                        .or_insert_with(|| (shard, WritePayload::default()));
                    id
                }
            };
            if let Some((_, group)) = groups.get_mut(&shard_id) {
                group.points.push(point);
            }
        }
        Ok(groups.into_values().collect())
    }

    async fn forward(
        &self,
        server_id: ServerId,
        shard_id: ShardId,
        write_id: WriteId,
        payload: &WritePayload,
    ) -> Result<usize> {
        METRICS.forwards_total.inc();
        let result = match self.connection(server_id) {
            Ok(conn) => conn.write_shard(shard_id, write_id, payload).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            METRICS.forward_failures.inc();
        }
        result
    }

    async fn write_shard(&self, local: ServerId, shard: Shard, payload: WritePayload) -> ShardWriteReport {
        let mut report = ShardWriteReport {
            shard_id: shard.id,
            sequence: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let record = WalRecord::local(payload);
        let sequence = match self.wal.append_write(shard.id, &record) {
            Ok(sequence) => sequence,
            Err(e) => {
                tracing::error!("WAL append for shard {} failed: {}", shard.id, e);
                report.failed = shard
                    .owners
                    .iter()
                    .map(|o| (*o, format!("not durable: {}", e)))
                    .collect();
                return report;
            }
        };
        report.sequence = sequence;
        let write_id = WriteId::new(local, sequence);
        let payload = record.payload;

        let mut applied_locally = true;
        if shard.is_local(local) {
            match self.local.apply_local(shard.id, write_id, &payload) {
                Ok(_) => report.succeeded.push(local),
                Err(e) => {
                    tracing::error!("Local apply of {} to shard {} failed: {}", write_id, shard.id, e);
                    applied_locally = false;
                    report.failed.push((local, e.to_string()));
                }
            }
        }

        let remotes: Vec<ServerId> = shard.owners.iter().copied().filter(|o| *o != local).collect();
        let outcomes = join_all(
            remotes
                .iter()
                .map(|owner| self.forward(*owner, shard.id, write_id, &payload)),
        )
        .await;
        for (owner, outcome) in remotes.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.succeeded.push(owner),
                Err(e) => {
                    tracing::warn!("Forwarding {} to {} failed: {}", write_id, owner, e);
                    report.failed.push((owner, e.to_string()));
                }
            }
        }

        // uncommitted entries are replayed at the next start
        if applied_locally {
            if let Err(e) = self.wal.commit(shard.id, sequence) {
                tracing::error!("WAL commit of {} failed: {}", write_id, e);
            }
        }
        report
    }

    /// Ask owners in turn, local first, until one answers.
    async fn query_shard(
        &self,
        local: ServerId,
        shard: &Shard,
        query: &ShardQuery,
    ) -> std::result::Result<Vec<Point>, String> {
        let mut owners = shard.owners.clone();
        owners.sort_by_key(|o| *o != local);

        let mut errors = Vec::new();
        for owner in owners {
            let result = if owner == local {
                self.local.query(shard.id, query)
            } else {
                match self.connection(owner) {
                    Ok(conn) => conn.query_shard(shard.id, query).await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(points) => return Ok(points),
                Err(e) => {
                    tracing::debug!("Query of shard {} on {} failed: {}", shard.id, owner, e);
                    errors.push(format!("{}: {}", owner, e));
                }
            }
        }
        Err(errors.join("; "))
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorImpl {
    async fn write(&self, target: ShardTarget, payload: WritePayload) -> Result<Vec<ShardWriteReport>> {
        let local = self.local_id()?;
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let points = payload.len();

        let groups = match target {
            ShardTarget::Shard(id) => {
                let shard = self.cluster.shard(id).ok_or(Error::ShardNotFound(id))?;
                vec![(shard, payload)]
            }
            ShardTarget::ByTime => self.group_by_time(payload).await?,
        };

        let reports = join_all(
            groups
                .into_iter()
                .map(|(shard, payload)| self.write_shard(local, shard, payload)),
        )
        .await;

        let complete = reports.iter().all(ShardWriteReport::is_complete);
        METRICS.record_write(start.elapsed(), points, complete);
        if complete {
            Ok(reports)
        } else {
            Err(Error::PartialWrite(reports))
        }
    }

    async fn query(&self, target: ShardTarget, query: ShardQuery) -> Result<Vec<Point>> {
        let local = self.local_id()?;
        METRICS.queries_total.inc();

        let shards = match target {
            ShardTarget::Shard(id) => vec![self.cluster.shard(id).ok_or(Error::ShardNotFound(id))?],
            ShardTarget::ByTime => self.cluster.shards_overlapping(query.start, query.end),
        };

        let results = join_all(shards.iter().map(|s| self.query_shard(local, s, &query))).await;
        let mut points = Vec::new();
        let mut failed_shards = Vec::new();
        for (shard, result) in shards.iter().zip(results) {
            match result {
                Ok(found) => points.extend(found),
                Err(reason) => failed_shards.push((shard.id, reason)),
            }
        }

        let points = merge_points(points, query.limit);
        if failed_shards.is_empty() {
            Ok(points)
        } else {
            METRICS.queries_partial.inc();
            Err(Error::PartialQuery(Box::new(PartialQuery {
                points,
                failed_shards,
            })))
        }
    }

    fn connect_to_peers(&self, self_id: ServerId) -> Result<()> {
        *self.local_id.write() = Some(self_id);
        let snapshot = self.cluster.snapshot();
        let mut connections = HashMap::new();
        for server in snapshot.servers.values().filter(|s| s.id != self_id) {
            connections.insert(server.id, (self.factory)(server)?);
        }
        tracing::info!("Connected to {} peer(s) as {}", connections.len(), self_id);
        *self.connections.write() = connections;
        Ok(())
    }

    fn peer_changed(&self, change: PeerChange) {
        match change {
            PeerChange::Upserted(server) => {
                if Some(server.id) == *self.local_id.read() {
                    return;
                }
                match (self.factory)(&server) {
                    Ok(conn) => {
                        tracing::debug!("Connection to {} at {}", server.id, server.connection);
                        self.connections.write().insert(server.id, conn);
                    }
                    Err(e) => tracing::warn!("Cannot connect to {}: {}", server.id, e),
                }
            }
            PeerChange::Removed(id) => {
                self.connections.write().remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterCommand, ClusterServer, ConnectionInfo, ServerRole, ShardDefinition};
    use crate::common::{Config, WalSyncPolicy};
    use crate::storage::ShardStore;
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    /// In-process stand-in for a remote server
    struct FakeServer {
        id: ServerId,
        reachable: bool,
        writes: Mutex<Vec<(ShardId, WriteId, WritePayload)>>,
    }

    #[tonic::async_trait]
    impl ServerConnection for FakeServer {
        fn server_id(&self) -> ServerId {
            self.id
        }

        async fn write_shard(
            &self,
            shard_id: ShardId,
            write_id: WriteId,
            payload: &WritePayload,
        ) -> Result<usize> {
            if !self.reachable {
                return Err(Error::Unreachable {
                    server: self.id.to_string(),
                    reason: "connection refused".into(),
                });
            }
            self.writes.lock().push((shard_id, write_id, payload.clone()));
            Ok(payload.len())
        }

        async fn query_shard(&self, _shard_id: ShardId, query: &ShardQuery) -> Result<Vec<Point>> {
            if !self.reachable {
                return Err(Error::Unreachable {
                    server: self.id.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(self
                .writes
                .lock()
                .iter()
                .flat_map(|(_, _, p)| p.points.clone())
                .filter(|p| query.matches(p))
                .collect())
        }
    }

    struct Fixture {
        _dir: TempDir,
        cluster: Arc<ClusterConfiguration>,
        wal: Arc<WriteAheadLog>,
        coordinator: CoordinatorImpl,
        fakes: Arc<Mutex<HashMap<ServerId, Arc<FakeServer>>>>,
    }

    /// Cluster of "me" (server-1) plus remote servers 2 and 3; server 3 is down.
    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let wal = Arc::new(WriteAheadLog::new(config.wal_dir(), WalSyncPolicy::Always, 1 << 20));
        let store = Arc::new(ShardStore::new(config.shard_dir()).unwrap());
        let cluster = Arc::new(ClusterConfiguration::new(&config, wal.clone(), store.clone()).unwrap());
        cluster.set_local_raft_name("me");
        for (index, name) in ["me", "b", "c"].iter().enumerate() {
            cluster.apply_command(
                index as u64 + 1,
                &ClusterCommand::RegisterServer {
                    raft_name: name.to_string(),
                    connection: ConnectionInfo::new(
                        format!("http://{}:8090", name),
                        format!("http://{}:8099", name),
                    ),
                    role: ServerRole::Voter,
                },
            );
        }
        wal.set_server_id(ServerId(1)).unwrap();

        let fakes: Arc<Mutex<HashMap<ServerId, Arc<FakeServer>>>> = Arc::default();
        let registry = fakes.clone();
        let factory: ConnectionFactory = Arc::new(move |server: &ClusterServer| {
            let fake = registry
                .lock()
                .entry(server.id)
                .or_insert_with(|| {
                    Arc::new(FakeServer {
                        id: server.id,
                        reachable: server.id != ServerId(3),
                        writes: Mutex::new(Vec::new()),
                    })
                })
                .clone();
            Ok(fake as Arc<dyn ServerConnection>)
        });

        let local = Arc::new(LocalShards::new(wal.clone(), store, cluster.clone()));
        let coordinator = CoordinatorImpl::new(cluster.clone(), wal.clone(), local, factory);
        coordinator.connect_to_peers(ServerId(1)).unwrap();
        Fixture {
            _dir: dir,
            cluster,
            wal,
            coordinator,
            fakes,
        }
    }

    /// Put a shard on exactly `owners`, bypassing hash placement.
    fn shard_on(f: &Fixture, index: u64, owners: Vec<ServerId>) -> ShardId {
        let (response, _) = f.cluster.apply_command(
            index,
            &ClusterCommand::CreateShard {
                definition: ShardDefinition {
                    start_time: 0,
                    end_time: 1_000,
                    replication_factor: 1,
                },
            },
        );
        let shard_id = match response {
            crate::cluster::CommandResponse::ShardCreated { shard_id, .. } => shard_id,
            other => panic!("unexpected {:?}", other),
        };
        f.cluster.apply_command(
            index + 1,
            &ClusterCommand::UpdateShardOwners { shard_id, owners },
        );
        shard_id
    }

    fn payload(timestamps: &[i64]) -> WritePayload {
        WritePayload::new(timestamps.iter().map(|ts| Point::new("cpu", *ts)).collect())
    }

    #[tokio::test]
    async fn test_write_reports_unreachable_owner() {
        let f = fixture();
        let shard_id = shard_on(&f, 10, vec![ServerId(2), ServerId(3)]);

        let err = f
            .coordinator
            .write(ShardTarget::Shard(shard_id), payload(&[1, 2]))
            .await
            .unwrap_err();
        let Error::PartialWrite(reports) = err else {
            panic!("expected a partial write");
        };
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].succeeded, vec![ServerId(2)]);
        assert_eq!(reports[0].failed.len(), 1);
        assert_eq!(reports[0].failed[0].0, ServerId(3));

        // the reachable owner got the write under the coordinator's identity
        let fakes = f.fakes.lock();
        let writes = fakes[&ServerId(2)].writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, WriteId::new(ServerId(1), reports[0].sequence));
        // not an owner here, so the intake entry is committed right away
        assert!(f.wal.uncommitted(shard_id).is_empty());
    }

    #[tokio::test]
    async fn test_write_local_and_remote_owner() {
        let f = fixture();
        let shard_id = shard_on(&f, 10, vec![ServerId(1), ServerId(2)]);

        let reports = f
            .coordinator
            .write(ShardTarget::Shard(shard_id), payload(&[5, 3]))
            .await
            .unwrap();
        assert_eq!(reports[0].succeeded, vec![ServerId(1), ServerId(2)]);
        assert_eq!(f.wal.committed_watermark(shard_id), Some(reports[0].sequence));

        let points = f
            .coordinator
            .query(ShardTarget::ByTime, ShardQuery::range(0, 1_000))
            .await
            .unwrap();
        assert_eq!(points.iter().map(|p| p.timestamp).collect::<Vec<_>>(), vec![3, 5]);
    }

    #[tokio::test]
    async fn test_query_falls_back_then_reports_partial() {
        let f = fixture();
        let shard_id = shard_on(&f, 10, vec![ServerId(3), ServerId(2)]);
        f.coordinator
            .write(ShardTarget::Shard(shard_id), payload(&[7]))
            .await
            .unwrap_err();

        // server-3 is down but server-2 answers
        let points = f
            .coordinator
            .query(ShardTarget::Shard(shard_id), ShardQuery::range(0, 1_000))
            .await
            .unwrap();
        assert_eq!(points.len(), 1);

        // with only the unreachable owner left, the shard is reported missing
        f.cluster.apply_command(
            20,
            &ClusterCommand::UpdateShardOwners {
                shard_id,
                owners: vec![ServerId(3)],
            },
        );
        let err = f
            .coordinator
            .query(ShardTarget::ByTime, ShardQuery::range(0, 1_000))
            .await
            .unwrap_err();
        let Error::PartialQuery(partial) = err else {
            panic!("expected a partial query");
        };
        assert_eq!(partial.failed_shards.len(), 1);
        assert_eq!(partial.failed_shards[0].0, shard_id);
    }

    #[tokio::test]
    async fn test_write_with_unrepresentable_timestamp_is_rejected() {
        let f = fixture();
        for ts in [i64::MAX - 5, i64::MIN] {
            let result = f.coordinator.write(ShardTarget::ByTime, payload(&[ts])).await;
            assert!(matches!(result, Err(Error::Rejected(_))), "{}: {:?}", ts, result);
        }
        assert!(f.cluster.snapshot().shards.is_empty());
    }

    #[tokio::test]
    async fn test_write_before_identity_is_not_ready() {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let wal = Arc::new(WriteAheadLog::new(config.wal_dir(), WalSyncPolicy::Always, 1 << 20));
        let store = Arc::new(ShardStore::new(config.shard_dir()).unwrap());
        let cluster = Arc::new(ClusterConfiguration::new(&config, wal.clone(), store.clone()).unwrap());
        let local = Arc::new(LocalShards::new(wal.clone(), store, cluster.clone()));
        let coordinator = CoordinatorImpl::new(
            cluster,
            wal,
            local,
            crate::rpc::grpc_connection_factory(config.rpc_timeout()),
        );
        assert!(matches!(
            coordinator.write(ShardTarget::ByTime, payload(&[1])).await,
            Err(Error::NotReady)
        ));
    }
}
