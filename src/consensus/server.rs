//! Consensus server
//!
//! Drives a [`RaftNode`]: the tick loop (elections and heartbeats), per-peer
//! replication, the apply loop feeding committed commands into the
//! [`ClusterConfiguration`], and the `RaftTransport` gRPC endpoint.

use crate::cluster::{
    ClusterCommand, ClusterConfiguration, ClusterEvent, ClusterState, CommandResponse,
    ConnectionInfo, ServerId, ServerRole, ShardCreator, ShardDefinition, ShardId,
};
use crate::common::{Config, Error, Result, METRICS};
use crate::consensus::client::RaftClient;
use crate::consensus::messages::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::consensus::node::{RaftNode, RaftRole, RaftTimings, Replication, TickAction};
use crate::consensus::storage::RaftStorage;
use crate::consensus::transport::RaftService;
use crate::coordinator::{Coordinator, PeerChange};
use crate::proto::raft_transport_server::RaftTransportServer;
use crate::proto::{JoinRequest, PROPOSE_NOT_LEADER, PROPOSE_NO_QUORUM, PROPOSE_OK};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

/// Committed entries applied per batch
const APPLY_BATCH: usize = 256;
/// Fallback wake-up for the apply loop
const APPLY_POLL: Duration = Duration::from_millis(100);
/// Delay between join or registration attempts
const RETRY_DELAY: Duration = Duration::from_millis(500);

type Waiter = oneshot::Sender<Result<CommandResponse>>;

/// State shared by the consensus tasks and the transport
pub(crate) struct RaftCore {
    raft_name: String,
    connection: ConnectionInfo,
    role: ServerRole,
    node: Mutex<RaftNode>,
    cluster: Arc<ClusterConfiguration>,
    client: RaftClient,
    /// Proposals wait on the leader for up to `proposal_timeout`, longer than one RPC
    forward_client: RaftClient,
    /// index -> (term, waiter)
    pending: Mutex<HashMap<u64, (u64, Waiter)>>,
    applied: watch::Sender<u64>,
    apply_notify: Notify,
    apply_lock: Mutex<()>,
    in_flight: Mutex<HashSet<String>>,
    coordinator: RwLock<Option<Weak<dyn Coordinator>>>,
    proposal_timeout: Duration,
    snapshot_threshold: u64,
    stopped: watch::Receiver<bool>,
}

impl RaftCore {
    pub(crate) fn request_vote(&self, req: &VoteRequest) -> Result<VoteResponse> {
        self.node.lock().handle_request_vote(req)
    }

    pub(crate) fn append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let (resp, advanced) = self.node.lock().handle_append_entries(req)?;
        if advanced {
            self.apply_notify.notify_one();
        }
        Ok(resp)
    }

    pub(crate) fn install_snapshot(&self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        let _apply = self.apply_lock.lock();
        let (resp, snapshot) = self.node.lock().handle_install_snapshot(req)?;
        let Some(snapshot) = snapshot else {
            return Ok(resp);
        };

        let state = ClusterState::decode(&snapshot.data)?;
        let servers: Vec<_> = state.servers.values().cloned().collect();
        self.cluster.restore(state);
        self.applied.send_replace(snapshot.index);
        METRICS.raft_applied_index.set(snapshot.index);

        // waiters inside the snapshot will never see their entry applied here
        let mut pending = self.pending.lock();
        let stale: Vec<u64> = pending
            .keys()
            .copied()
            .filter(|i| *i <= snapshot.index)
            .collect();
        for index in stale {
            if let Some((_, waiter)) = pending.remove(&index) {
                let _ = waiter.send(Err(Error::NotLeader("snapshot installed".into())));
            }
        }
        drop(pending);

        self.sync_membership();
        if let Some(coordinator) = self.coordinator() {
            for server in servers {
                coordinator.peer_changed(PeerChange::Upserted(server));
            }
        }
        Ok(resp)
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.node.lock().is_leader()
    }

    pub(crate) fn leader_addr(&self) -> Option<String> {
        self.node.lock().leader().map(|(_, addr)| addr)
    }

    fn coordinator(&self) -> Option<Arc<dyn Coordinator>> {
        self.coordinator.read().as_ref().and_then(Weak::upgrade)
    }

    /// Take membership from the applied configuration. An empty configuration keeps
    /// the bootstrap membership.
    fn sync_membership(&self) {
        let state = self.cluster.snapshot();
        if state.servers.is_empty() {
            return;
        }
        let voters: BTreeSet<String> = state.voters();
        let members: BTreeMap<String, String> = state
            .servers
            .values()
            .map(|s| {
                (
                    s.raft_name.clone(),
                    s.connection.raft_connection_string.clone(),
                )
            })
            .collect();
        self.node.lock().set_membership(voters, members);
    }

    /// Apply every committed entry not yet applied.
    fn apply_committed(&self) -> Result<usize> {
        let _apply = self.apply_lock.lock();
        let mut applied_count = 0;
        let mut changes = Vec::new();

        loop {
            let applied = *self.applied.borrow();
            let entries = {
                let node = self.node.lock();
                if node.commit_index() <= applied {
                    break;
                }
                node.log().entries_from(applied + 1, APPLY_BATCH)
            };
            if entries.is_empty() {
                return Err(Error::Raft(format!(
                    "committed entry {} is missing from the log",
                    applied + 1
                )));
            }

            for entry in entries {
                let (response, events) = self.cluster.apply_entry(entry.index, &entry.data)?;
                self.applied.send_replace(entry.index);
                METRICS.raft_applied_index.set(entry.index);
                applied_count += 1;

                if let Some((term, waiter)) = self.pending.lock().remove(&entry.index) {
                    let result = if term == entry.term {
                        Ok(response)
                    } else {
                        Err(Error::NotLeader(format!(
                            "entry {} was replaced by term {}",
                            entry.index, entry.term
                        )))
                    };
                    let _ = waiter.send(result);
                }

                for event in events {
                    match event {
                        ClusterEvent::ServerUpserted(server) => {
                            changes.push(PeerChange::Upserted(server))
                        }
                        ClusterEvent::ServerRemoved(id) => changes.push(PeerChange::Removed(id)),
                        _ => {}
                    }
                }
            }
        }

        if !changes.is_empty() {
            self.sync_membership();
            if let Some(coordinator) = self.coordinator() {
                for change in changes {
                    coordinator.peer_changed(change);
                }
            }
        }
        self.maybe_snapshot()?;
        Ok(applied_count)
    }

    fn maybe_snapshot(&self) -> Result<()> {
        let applied = *self.applied.borrow();
        let mut node = self.node.lock();
        if applied.saturating_sub(node.log().snapshot_index()) < self.snapshot_threshold {
            return Ok(());
        }
        let data = self.cluster.snapshot().encode()?;
        node.compact(applied, data)
    }

    async fn wait_applied(&self, index: u64) -> Result<()> {
        let mut applied = self.applied.subscribe();
        tokio::time::timeout(self.proposal_timeout, applied.wait_for(|a| *a >= index))
            .await
            .map_err(|_| Error::Timeout(format!("entry {} not applied locally", index)))?
            .map_err(|_| Error::ShuttingDown)?;
        Ok(())
    }

    /// Propose a command, forwarding to the leader if this node is not it.
    pub(crate) async fn propose(self: &Arc<Self>, command: &ClusterCommand) -> Result<CommandResponse> {
        if *self.stopped.borrow() {
            return Err(Error::ShuttingDown);
        }
        let forward_to = {
            let node = self.node.lock();
            if node.is_leader() {
                None
            } else {
                Some(node.leader().map(|(_, addr)| addr))
            }
        };

        match forward_to {
            None => self.propose_as_leader(command).await.map(|(_, r)| r),
            Some(Some(addr)) => self.forward(&addr, command).await,
            Some(None) => {
                METRICS.raft_proposal_failures.inc();
                Err(Error::NoQuorum("no leader known".into()))
            }
        }
    }

    /// Append as leader and wait for the entry to apply. Returns (index, response).
    pub(crate) async fn propose_as_leader(
        self: &Arc<Self>,
        command: &ClusterCommand,
    ) -> Result<(u64, CommandResponse)> {
        let data = bincode::serialize(command)?;
        let (index, waiter) = {
            let mut node = self.node.lock();
            let (index, term) = node.append_command(data)?;
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(index, (term, tx));
            (index, rx)
        };
        tracing::debug!("Proposed {} at index {}", command.name(), index);
        self.replicate_all();
        self.apply_notify.notify_one();

        match tokio::time::timeout(self.proposal_timeout, waiter).await {
            Ok(Ok(result)) => result.map(|response| (index, response)),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => {
                self.pending.lock().remove(&index);
                METRICS.raft_proposal_failures.inc();
                Err(Error::NoQuorum(format!(
                    "{} at index {} not committed within {:?}",
                    command.name(),
                    index,
                    self.proposal_timeout
                )))
            }
        }
    }

    async fn forward(&self, leader: &str, command: &ClusterCommand) -> Result<CommandResponse> {
        let data = bincode::serialize(command)?;
        tracing::debug!("Forwarding {} to leader {}", command.name(), leader);
        let resp = match self.forward_client.propose(leader, data).await {
            Ok(resp) => resp,
            Err(e) => {
                METRICS.raft_proposal_failures.inc();
                return Err(Error::NoQuorum(format!("leader {} unreachable: {}", leader, e)));
            }
        };

        match resp.error_code {
            PROPOSE_OK => {
                let response: CommandResponse = bincode::deserialize(&resp.response)?;
                self.wait_applied(resp.index).await?;
                Ok(response)
            }
            PROPOSE_NO_QUORUM => {
                METRICS.raft_proposal_failures.inc();
                Err(Error::NoQuorum(resp.error))
            }
            PROPOSE_NOT_LEADER => Err(Error::NotLeader(resp.error)),
            _ => Err(Error::Raft(resp.error)),
        }
    }

    pub(crate) async fn join(self: &Arc<Self>, req: JoinRequest) -> Result<ServerId> {
        let role = if req.voter {
            ServerRole::Voter
        } else {
            ServerRole::Follower
        };
        tracing::info!(
            "Join request from {} at {} ({})",
            req.raft_name,
            req.raft_connection_string,
            role
        );
        let command = ClusterCommand::RegisterServer {
            raft_name: req.raft_name,
            connection: ConnectionInfo::new(req.raft_connection_string, req.rpc_connection_string),
            role,
        };
        match self.propose(&command).await?.into_result()? {
            CommandResponse::ServerRegistered(id) => Ok(id),
            other => Err(Error::Internal(format!("unexpected join response {:?}", other))),
        }
    }

    // === Background tasks ===

    fn campaign(self: &Arc<Self>, req: VoteRequest) {
        let peers = self.node.lock().voter_peers();
        for (name, addr) in peers {
            let core = self.clone();
            let req = req.clone();
            tokio::spawn(async move {
                let resp = match core.client.request_vote(&addr, &req).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::debug!("Vote request to {} failed: {}", name, e);
                        return;
                    }
                };
                let won = core.node.lock().handle_vote_response(req.term, &name, &resp);
                match won {
                    Ok(true) => {
                        core.replicate_all();
                        core.apply_notify.notify_one();
                    }
                    Ok(false) => {}
                    Err(e) => tracing::error!("Failed to count vote from {}: {}", name, e),
                }
            });
        }
    }

    fn replicate_all(self: &Arc<Self>) {
        let peers = self.node.lock().peers();
        for (name, addr) in peers {
            if !self.in_flight.lock().insert(name.clone()) {
                continue;
            }
            let core = self.clone();
            tokio::spawn(async move {
                core.replicate_peer(&name, &addr).await;
                core.in_flight.lock().remove(&name);
            });
        }
    }

    async fn replicate_peer(&self, name: &str, addr: &str) {
        loop {
            let request = self.node.lock().replication_request(name);
            let request = match request {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("Cannot build replication for {}: {}", name, e);
                    return;
                }
            };

            let advanced = match request {
                Replication::Append(req) => {
                    let resp = match self.client.append_entries(addr, &req).await {
                        Ok(resp) => resp,
                        Err(e) => {
                            tracing::debug!("AppendEntries to {} failed: {}", name, e);
                            return;
                        }
                    };
                    self.node.lock().handle_append_response(name, &resp)
                }
                Replication::Snapshot(req) => {
                    let index = req.last_included_index;
                    tracing::info!("Sending snapshot at index {} to {}", index, name);
                    let resp = match self.client.install_snapshot(addr, &req).await {
                        Ok(resp) => resp,
                        Err(e) => {
                            tracing::warn!("InstallSnapshot to {} failed: {}", name, e);
                            return;
                        }
                    };
                    self.node.lock().handle_snapshot_response(name, index, &resp)
                }
            };

            match advanced {
                Ok(true) => self.apply_notify.notify_one(),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to handle replication reply from {}: {}", name, e);
                    return;
                }
            }

            let behind = self.node.lock().has_pending(name);
            if !behind {
                return;
            }
        }
    }

    async fn run_ticks(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let action = self.node.lock().tick(Instant::now());
            match action {
                Ok(TickAction::Idle) => {}
                Ok(TickAction::Campaign(req)) => self.campaign(req),
                Ok(TickAction::Heartbeat) => {
                    self.replicate_all();
                    self.apply_notify.notify_one();
                }
                Err(e) => tracing::error!("Raft tick failed: {}", e),
            }
        }
        tracing::debug!("Raft tick loop stopped");
    }

    async fn run_apply(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = tokio::time::sleep(APPLY_POLL) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.apply_committed() {
                tracing::error!("Failed to apply committed entries: {}", e);
            }
        }
        tracing::debug!("Raft apply loop stopped");
    }

    /// Register this node in a cluster it bootstrapped, once it leads.
    async fn register_self(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let command = ClusterCommand::RegisterServer {
            raft_name: self.raft_name.clone(),
            connection: self.connection.clone(),
            role: self.role,
        };
        loop {
            match self.propose(&command).await.and_then(CommandResponse::into_result) {
                Ok(CommandResponse::ServerRegistered(id)) => {
                    tracing::info!("Bootstrapped cluster as {}", id);
                    return;
                }
                Ok(other) => {
                    tracing::error!("Unexpected registration response {:?}", other);
                    return;
                }
                Err(Error::ShuttingDown) => return,
                Err(e) => tracing::debug!("Self registration pending: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Ask the seed servers to register this node until one of them accepts.
    async fn join_cluster(self: Arc<Self>, seeds: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let req = JoinRequest {
            raft_name: self.raft_name.clone(),
            raft_connection_string: self.connection.raft_connection_string.clone(),
            rpc_connection_string: self.connection.rpc_connection_string.clone(),
            voter: self.role == ServerRole::Voter,
        };
        loop {
            for seed in &seeds {
                match self.forward_client.join(seed, req.clone()).await {
                    Ok(resp) => {
                        tracing::info!("Joined cluster through {} as server-{}", seed, resp.server_id);
                        return;
                    }
                    Err(e) => tracing::warn!("Join through {} failed: {}", seed, e),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }
}

/// Raft-backed owner of the cluster configuration
pub struct ConsensusServer {
    core: Arc<RaftCore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsensusServer {
    /// Open the consensus state, bind the transport and start the background tasks.
    ///
    /// A node with no cluster state and no seeds bootstraps a one-node cluster;
    /// a node with seeds joins through them.
    pub async fn start(config: &Config, cluster: Arc<ClusterConfiguration>) -> Result<Arc<Self>> {
        let storage = Arc::new(RaftStorage::open(config.raft_dir())?);
        let raft_name = match storage.raft_name()? {
            Some(name) => name,
            None => {
                let name = uuid::Uuid::new_v4().to_string();
                storage.set_raft_name(&name)?;
                tracing::info!("Generated raft name {}", name);
                name
            }
        };
        cluster.set_local_raft_name(&raft_name);

        if let Some(snapshot) = storage.load_snapshot()? {
            cluster.restore(ClusterState::decode(&snapshot.data)?);
        }

        let timings = RaftTimings {
            election_timeout: config.election_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        };
        let node = RaftNode::open(
            raft_name.clone(),
            config.raft_connection_string(),
            storage,
            timings,
        )?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (applied, _) = watch::channel(cluster.snapshot().applied_index);
        let core = Arc::new(RaftCore {
            raft_name: raft_name.clone(),
            connection: ConnectionInfo::new(
                config.raft_connection_string(),
                config.rpc_connection_string(),
            ),
            role: if config.leader_eligible {
                ServerRole::Voter
            } else {
                ServerRole::Follower
            },
            node: Mutex::new(node),
            cluster: cluster.clone(),
            client: RaftClient::new(config.rpc_timeout()),
            forward_client: RaftClient::new(config.proposal_timeout() + config.rpc_timeout()),
            pending: Mutex::new(HashMap::new()),
            applied,
            apply_notify: Notify::new(),
            apply_lock: Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
            coordinator: RwLock::new(None),
            proposal_timeout: config.proposal_timeout(),
            snapshot_threshold: config.snapshot_threshold.max(1),
            stopped: shutdown_rx.clone(),
        });

        // entries committed before the restart
        let replayed = core.apply_committed()?;
        if replayed > 0 {
            tracing::info!("Re-applied {} committed raft entries", replayed);
        }

        let bootstrap = cluster.snapshot().servers.is_empty() && config.seed_servers.is_empty();
        if bootstrap {
            tracing::info!("No cluster state and no seeds, bootstrapping a new cluster");
            core.node.lock().bootstrap();
        } else {
            core.sync_membership();
        }

        let listener = TcpListener::bind(config.raft_bind).await?;
        tracing::info!(
            "Raft transport listening on {} as {}",
            listener.local_addr()?,
            raft_name
        );

        let mut tasks = Vec::new();
        let service = RaftService::new(core.clone());
        let mut server_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(RaftTransportServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Raft transport error: {}", e);
            }
        }));

        let tick_interval = (config.heartbeat_interval() / 2).max(Duration::from_millis(5));
        tasks.push(tokio::spawn(
            core.clone().run_ticks(tick_interval, shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(core.clone().run_apply(shutdown_rx.clone())));

        if cluster.local_server().is_none() {
            if bootstrap {
                tasks.push(tokio::spawn(core.clone().register_self(shutdown_rx.clone())));
            } else if !config.seed_servers.is_empty() {
                tasks.push(tokio::spawn(core.clone().join_cluster(
                    config.seed_servers.clone(),
                    shutdown_rx.clone(),
                )));
            }
        }

        Ok(Arc::new(Self {
            core,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn raft_name(&self) -> &str {
        &self.core.raft_name
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    /// Current leader as (raft name, raft connection string)
    pub fn leader(&self) -> Option<(String, String)> {
        self.core.node.lock().leader()
    }

    pub fn term(&self) -> u64 {
        self.core.node.lock().term()
    }

    pub fn role(&self) -> RaftRole {
        self.core.node.lock().role()
    }

    pub fn commit_index(&self) -> u64 {
        self.core.node.lock().commit_index()
    }

    pub fn applied_index(&self) -> u64 {
        *self.core.applied.borrow()
    }

    /// Late-bind the coordinator that is told about membership changes.
    pub fn assign_coordinator(&self, coordinator: Weak<dyn Coordinator>) {
        *self.core.coordinator.write() = Some(coordinator);
    }

    /// Propose a command and wait until it has applied on this node.
    pub async fn propose(&self, command: ClusterCommand) -> Result<CommandResponse> {
        self.core.propose(&command).await?.into_result()
    }

    /// Add a server, or confirm an identical registration.
    pub async fn register_new_server(
        &self,
        raft_name: &str,
        connection: ConnectionInfo,
        role: ServerRole,
    ) -> Result<ServerId> {
        let command = ClusterCommand::RegisterServer {
            raft_name: raft_name.to_string(),
            connection,
            role,
        };
        match self.propose(command).await? {
            CommandResponse::ServerRegistered(id) => Ok(id),
            other => Err(Error::Internal(format!("unexpected response {:?}", other))),
        }
    }

    /// Update this node's own addresses in place.
    pub async fn correct_own_address(&self, connection: ConnectionInfo) -> Result<ServerId> {
        tracing::info!("Correcting own address to {}", connection);
        let command = ClusterCommand::CorrectAddress {
            raft_name: self.core.raft_name.clone(),
            connection,
        };
        match self.propose(command).await? {
            CommandResponse::AddressCorrected(id) => Ok(id),
            other => Err(Error::Internal(format!("unexpected response {:?}", other))),
        }
    }

    /// `force == false` registers, `force == true` corrects the addresses of an
    /// already registered server.
    pub async fn propose_membership_change(
        &self,
        raft_name: &str,
        connection: ConnectionInfo,
        force: bool,
    ) -> Result<ServerId> {
        if !force {
            let role = if raft_name == self.core.raft_name {
                self.core.role
            } else {
                ServerRole::Voter
            };
            return self.register_new_server(raft_name, connection, role).await;
        }
        if raft_name == self.core.raft_name {
            return self.correct_own_address(connection).await;
        }
        let command = ClusterCommand::CorrectAddress {
            raft_name: raft_name.to_string(),
            connection,
        };
        match self.propose(command).await? {
            CommandResponse::AddressCorrected(id) => Ok(id),
            other => Err(Error::Internal(format!("unexpected response {:?}", other))),
        }
    }

    pub async fn remove_server(&self, server_id: ServerId) -> Result<()> {
        self.propose(ClusterCommand::RemoveServer { server_id }).await?;
        Ok(())
    }

    pub async fn update_shard_owners(&self, shard_id: ShardId, owners: Vec<ServerId>) -> Result<()> {
        self.propose(ClusterCommand::UpdateShardOwners { shard_id, owners })
            .await?;
        Ok(())
    }

    pub async fn drop_shard(&self, shard_id: ShardId) -> Result<()> {
        self.propose(ClusterCommand::DropShard { shard_id }).await?;
        Ok(())
    }

    /// Stop every consensus task and the transport. Not restartable.
    pub async fn stop(&self) -> Result<()> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }
        tracing::info!("Stopping consensus server {}", self.core.raft_name);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Consensus task ended abnormally: {}", e);
            }
        }

        let waiters: Vec<_> = self.core.pending.lock().drain().collect();
        for (_, (_, waiter)) in waiters {
            let _ = waiter.send(Err(Error::ShuttingDown));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl ShardCreator for ConsensusServer {
    async fn create_shard(&self, definition: ShardDefinition) -> Result<ShardId> {
        match self.propose(ClusterCommand::CreateShard { definition }).await? {
            CommandResponse::ShardCreated { shard_id, created } => {
                if created {
                    tracing::info!("Created shard {}", shard_id);
                }
                Ok(shard_id)
            }
            other => Err(Error::Internal(format!("unexpected response {:?}", other))),
        }
    }
}
