//! Node orchestration
//!
//! Wires the WAL, shard store, cluster configuration, consensus and coordinator
//! together and brings them up in a fixed order:
//! 1. consensus transport
//! 2. local membership observed
//! 3. WAL identity, address correction, WAL recovery
//! 4. shard RPC, peer connections
//! 5. background maintenance, status API

pub mod http;
pub mod lifecycle;

use crate::cluster::{ClusterConfiguration, ConnectionInfo, ServerId, ShardCreator};
use crate::common::{Config, Error, Result, ShardWriteReport};
use crate::consensus::ConsensusServer;
use crate::coordinator::{Coordinator, CoordinatorImpl, LocalShards, ShardTarget};
use crate::rpc::{grpc_connection_factory, RpcServer};
use crate::storage::{CompactionManager, Point, ShardQuery, ShardStore, WriteAheadLog, WritePayload};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use lifecycle::{Lifecycle, LifecycleState};

/// How long startup keeps retrying its own address correction
const STARTUP_PROPOSAL_WINDOW: Duration = Duration::from_secs(30);

/// Point-in-time view of the node for the status API
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub version: String,
    pub state: LifecycleState,
    pub raft_name: Option<String>,
    pub server_id: Option<ServerId>,
    pub raft_role: Option<String>,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub servers: usize,
    pub shards: usize,
    pub local_shards: usize,
    pub connected_peers: Vec<ServerId>,
    pub uptime_secs: u64,
}

pub struct Node {
    config: Config,
    lifecycle: Lifecycle,
    wal: Arc<WriteAheadLog>,
    store: Arc<ShardStore>,
    cluster: Arc<ClusterConfiguration>,
    local: Arc<LocalShards>,
    coordinator: Arc<CoordinatorImpl>,
    consensus: RwLock<Option<Arc<ConsensusServer>>>,
    rpc: Mutex<Option<RpcServer>>,
    rpc_addr: RwLock<Option<SocketAddr>>,
    status: Mutex<Option<JoinHandle<()>>>,
    status_addr: RwLock<Option<SocketAddr>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    status_shutdown: watch::Sender<bool>,
    background_shutdown: watch::Sender<bool>,
    rpc_shutdown: watch::Sender<bool>,
}

impl Node {
    /// Build every component. Nothing listens until `listen_and_serve`.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let wal = Arc::new(WriteAheadLog::new(
            config.wal_dir(),
            config.wal_sync,
            config.wal_segment_bytes,
        ));
        let store = Arc::new(ShardStore::new(config.shard_dir())?);
        let cluster = Arc::new(ClusterConfiguration::new(&config, wal.clone(), store.clone())?);
        let local = Arc::new(LocalShards::new(wal.clone(), store.clone(), cluster.clone()));
        let coordinator = Arc::new(CoordinatorImpl::new(
            cluster.clone(),
            wal.clone(),
            local.clone(),
            grpc_connection_factory(config.rpc_timeout()),
        ));

        let (status_shutdown, _) = watch::channel(false);
        let (background_shutdown, _) = watch::channel(false);
        let (rpc_shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            lifecycle: Lifecycle::new(),
            wal,
            store,
            cluster,
            local,
            coordinator,
            consensus: RwLock::new(None),
            rpc: Mutex::new(None),
            rpc_addr: RwLock::new(None),
            status: Mutex::new(None),
            status_addr: RwLock::new(None),
            background: Mutex::new(Vec::new()),
            status_shutdown,
            background_shutdown,
            rpc_shutdown,
        }))
    }

    /// Bring the node up. Returns once it is `Running`, or with the first startup error.
    pub async fn listen_and_serve(self: &Arc<Self>) -> Result<()> {
        if self.lifecycle.state() != LifecycleState::Starting {
            return Err(Error::Internal(format!(
                "cannot start a node in state {}",
                self.lifecycle.state()
            )));
        }
        tracing::info!("Starting chronodb node {}", crate::VERSION);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Raft: {}", self.config.raft_connection_string());
        tracing::info!("  RPC: {}", self.config.rpc_connection_string());

        let consensus = ConsensusServer::start(&self.config, self.cluster.clone()).await?;
        let creator: Weak<dyn ShardCreator> = Arc::downgrade(&consensus) as Weak<dyn ShardCreator>;
        self.cluster.set_shard_creator(creator);
        let coordinator: Weak<dyn Coordinator> =
            Arc::downgrade(&self.coordinator) as Weak<dyn Coordinator>;
        consensus.assign_coordinator(coordinator);
        *self.consensus.write() = Some(consensus.clone());

        let server_id = self.wait_for_membership().await?;
        tracing::info!("Registered as {}", server_id);
        self.wal.set_server_id(server_id)?;

        let desired = ConnectionInfo::new(
            self.config.raft_connection_string(),
            self.config.rpc_connection_string(),
        );
        if let Some(me) = self.cluster.local_server() {
            if me.connection != desired {
                tracing::info!("Address changed from {} to {}", me.connection, desired);
                self.correct_address(&consensus, desired).await?;
            }
        }

        self.cluster.open_local_shards();
        let recovered = self.cluster.recover_from_wal()?;
        tracing::info!("WAL recovery complete ({} entries)", recovered);

        let rpc = RpcServer::start(
            self.config.rpc_bind,
            self.local.clone(),
            self.rpc_shutdown.subscribe(),
        )
        .await?;
        *self.rpc_addr.write() = Some(rpc.local_addr());
        *self.rpc.lock() = Some(rpc);

        self.coordinator.connect_to_peers(server_id)?;

        {
            let mut background = self.background.lock();
            background.push(
                self.cluster
                    .clone()
                    .create_future_shards_automatically_before_time_comes(
                        self.background_shutdown.subscribe(),
                    ),
            );
            let compaction = CompactionManager::new(
                self.wal.clone(),
                self.store.clone(),
                Duration::from_secs(self.config.wal_compaction_interval_secs.max(1)),
            );
            background.push(compaction.start(self.background_shutdown.subscribe()));
        }

        if let Some(addr) = self.config.status_bind {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            *self.status_addr.write() = Some(listener.local_addr()?);
            tracing::info!("Status API listening on {}", listener.local_addr()?);
            let router = http::create_router(self.clone());
            let mut shutdown = self.status_shutdown.subscribe();
            let handle = tokio::spawn(async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!("Status API error: {}", e);
                }
            });
            *self.status.lock() = Some(handle);
        }

        if !self
            .lifecycle
            .transition(LifecycleState::Starting, LifecycleState::Running)
        {
            return Err(Error::ShuttingDown);
        }
        tracing::info!("✓ Node {} ready", server_id);
        Ok(())
    }

    async fn wait_for_membership(&self) -> Result<ServerId> {
        let mut shutdown = self.background_shutdown.subscribe();
        tokio::select! {
            id = self.cluster.wait_for_local_server_loaded() => Ok(id),
            _ = shutdown.wait_for(|stop| *stop) => Err(Error::ShuttingDown),
        }
    }

    /// Retry while no leader is known yet; a restarted node may still be electing one.
    async fn correct_address(
        &self,
        consensus: &ConsensusServer,
        connection: ConnectionInfo,
    ) -> Result<ServerId> {
        let deadline = tokio::time::Instant::now() + STARTUP_PROPOSAL_WINDOW;
        loop {
            match consensus.correct_own_address(connection.clone()).await {
                Err(e) if e.is_retryable() && tokio::time::Instant::now() < deadline => {
                    tracing::debug!("Address correction pending: {}", e);
                    tokio::time::sleep(self.config.heartbeat_interval()).await;
                }
                result => return result,
            }
        }
    }

    /// Stop everything in reverse dependency order. Only the first caller does the work.
    pub async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        tracing::info!("Stopping node");

        self.status_shutdown.send_replace(true);
        let status = self.status.lock().take();
        if let Some(handle) = status {
            if let Err(e) = handle.await {
                tracing::warn!("Status API task ended abnormally: {}", e);
            }
        }

        self.background_shutdown.send_replace(true);
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        let consensus = self.consensus.read().clone();
        if let Some(consensus) = consensus {
            consensus.stop().await?;
        }

        self.rpc_shutdown.send_replace(true);
        let rpc = self.rpc.lock().take();
        if let Some(rpc) = rpc {
            rpc.join().await;
        }

        self.wal.close()?;
        self.store.close()?;

        self.lifecycle
            .transition(LifecycleState::Stopping, LifecycleState::Stopped);
        tracing::info!("Node stopped");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match self.lifecycle.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Starting => Err(Error::NotReady),
            LifecycleState::Stopping | LifecycleState::Stopped => Err(Error::ShuttingDown),
        }
    }

    /// Accept a write, routed by point timestamps.
    pub async fn write(&self, payload: WritePayload) -> Result<Vec<ShardWriteReport>> {
        self.ensure_running()?;
        self.coordinator.write(ShardTarget::ByTime, payload).await
    }

    pub async fn write_to_shard(
        &self,
        shard_id: u64,
        payload: WritePayload,
    ) -> Result<Vec<ShardWriteReport>> {
        self.ensure_running()?;
        self.coordinator
            .write(ShardTarget::Shard(shard_id), payload)
            .await
    }

    pub async fn query(&self, query: ShardQuery) -> Result<Vec<Point>> {
        self.ensure_running()?;
        self.coordinator.query(ShardTarget::ByTime, query).await
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterConfiguration> {
        &self.cluster
    }

    pub fn consensus(&self) -> Option<Arc<ConsensusServer>> {
        self.consensus.read().clone()
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    pub fn server_id(&self) -> Option<ServerId> {
        self.cluster.server_id()
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        *self.rpc_addr.read()
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        *self.status_addr.read()
    }

    pub fn status(&self) -> NodeStatus {
        let snapshot = self.cluster.snapshot();
        let server_id = self.cluster.server_id();
        let consensus = self.consensus();
        let local_shards = server_id
            .map(|id| snapshot.local_shards(id).len())
            .unwrap_or(0);
        NodeStatus {
            version: crate::VERSION.to_string(),
            state: self.lifecycle.state(),
            raft_name: self.cluster.local_raft_name(),
            server_id,
            raft_role: consensus.as_ref().map(|c| c.role().to_string()),
            term: consensus.as_ref().map_or(0, |c| c.term()),
            leader: consensus.as_ref().and_then(|c| c.leader()).map(|(name, _)| name),
            commit_index: consensus.as_ref().map_or(0, |c| c.commit_index()),
            applied_index: snapshot.applied_index,
            servers: snapshot.servers.len(),
            shards: snapshot.shards.len(),
            local_shards,
            connected_peers: self.coordinator.connected_peers(),
            uptime_secs: crate::common::METRICS.uptime_seconds(),
        }
    }
}
