//! Raft consensus node
//!
//! The synchronous core of the protocol: role transitions, vote and append
//! handling, commit advancement. It performs no I/O besides persisting to
//! [`RaftStorage`]; the server drives it from its tick loop and RPC handlers.

use crate::cluster::ClusterCommand;
use crate::common::{Error, Result, METRICS};
use crate::consensus::log::RaftLog;
use crate::consensus::messages::{
    AppendRequest, AppendResponse, LogEntry, SnapshotRequest, SnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::consensus::storage::{HardState, RaftStorage, Snapshot};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entries sent in one AppendEntries request
const MAX_ENTRIES_PER_APPEND: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// What the driver should do after a tick
#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    /// Send this vote request to every other voter
    Campaign(VoteRequest),
    /// Replicate to every peer
    Heartbeat,
}

/// What a leader sends a given peer next
#[derive(Debug)]
pub enum Replication {
    Append(AppendRequest),
    Snapshot(SnapshotRequest),
}

#[derive(Debug, Clone, Copy)]
pub struct RaftTimings {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

pub struct RaftNode {
    id: String,
    addr: String,
    role: RaftRole,
    term: u64,
    voted_for: Option<String>,
    /// (raft name, raft connection string)
    leader: Option<(String, String)>,
    log: RaftLog,
    commit_index: u64,
    /// Servers counted for elections and commit
    voters: BTreeSet<String>,
    /// Every server the leader replicates to, by raft name
    members: BTreeMap<String, String>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes: BTreeSet<String>,
    timings: RaftTimings,
    election_deadline: Instant,
    last_heartbeat: Instant,
    storage: Arc<RaftStorage>,
}

impl RaftNode {
    /// Restore a node from its persisted state
    pub fn open(
        id: String,
        addr: String,
        storage: Arc<RaftStorage>,
        timings: RaftTimings,
    ) -> Result<Self> {
        let hard = storage.load_hard_state()?;
        let log = RaftLog::load(storage.clone())?;
        let commit_index = hard.commit.max(log.snapshot_index()).min(log.last_index());
        let now = Instant::now();

        let mut node = Self {
            id,
            addr,
            role: RaftRole::Follower,
            term: hard.term,
            voted_for: hard.voted_for,
            leader: None,
            log,
            commit_index,
            voters: BTreeSet::new(),
            members: BTreeMap::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: BTreeSet::new(),
            timings,
            election_deadline: now,
            last_heartbeat: now,
            storage,
        };
        node.reset_election_timer();
        METRICS.raft_term.set(node.term);
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> Option<(String, String)> {
        self.leader.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn voters(&self) -> &BTreeSet<String> {
        &self.voters
    }

    /// Other members as (raft name, raft connection string)
    pub fn peers(&self) -> Vec<(String, String)> {
        self.members
            .iter()
            .filter(|(name, _)| **name != self.id)
            .map(|(name, addr)| (name.clone(), addr.clone()))
            .collect()
    }

    /// Other voters as (raft name, raft connection string)
    pub fn voter_peers(&self) -> Vec<(String, String)> {
        self.peers()
            .into_iter()
            .filter(|(name, _)| self.voters.contains(name))
            .collect()
    }

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn persist(&self) -> Result<()> {
        self.storage.save_hard_state(&HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit: self.commit_index,
        })
    }

    fn reset_election_timer(&mut self) {
        let base = self.timings.election_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        self.election_deadline = Instant::now() + Duration::from_millis(base + jitter);
    }

    /// Make this node the only voter of a brand-new cluster
    pub fn bootstrap(&mut self) {
        self.voters = BTreeSet::from([self.id.clone()]);
        self.members = BTreeMap::from([(self.id.clone(), self.addr.clone())]);
    }

    /// Replace the membership with the one of the applied cluster configuration.
    pub fn set_membership(&mut self, voters: BTreeSet<String>, members: BTreeMap<String, String>) {
        let next = self.log.last_index() + 1;
        if self.is_leader() {
            for name in members.keys() {
                if *name != self.id && !self.next_index.contains_key(name) {
                    self.next_index.insert(name.clone(), next);
                    self.match_index.insert(name.clone(), 0);
                }
            }
            self.next_index.retain(|name, _| members.contains_key(name));
            self.match_index.retain(|name, _| members.contains_key(name));
        }
        self.voters = voters;
        self.members = members;

        if self.role != RaftRole::Follower && !self.voters.contains(&self.id) {
            tracing::info!("{} is no longer a voter, stepping down", self.id);
            self.role = RaftRole::Follower;
            self.votes.clear();
        }
    }

    fn step_down(&mut self, term: u64) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            self.persist()?;
            METRICS.raft_term.set(term);
        }
        if self.role != RaftRole::Follower {
            tracing::info!("{} stepping down to follower in term {}", self.id, self.term);
        }
        self.role = RaftRole::Follower;
        self.votes.clear();
        Ok(())
    }

    /// Handle a RequestVote RPC
    pub fn handle_request_vote(&mut self, req: &VoteRequest) -> Result<VoteResponse> {
        if req.term > self.term {
            self.step_down(req.term)?;
        }

        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (self.log.last_term(), self.log.last_index());
        let free = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == req.candidate_id,
        };
        let vote_granted = req.term == self.term && up_to_date && free;

        if vote_granted {
            self.voted_for = Some(req.candidate_id.clone());
            self.persist()?;
            self.reset_election_timer();
            tracing::debug!(
                "{} voted for {} in term {}",
                self.id,
                req.candidate_id,
                self.term
            );
        }

        Ok(VoteResponse {
            term: self.term,
            vote_granted,
        })
    }

    /// Handle an AppendEntries RPC. Returns the response and whether the commit index moved.
    pub fn handle_append_entries(&mut self, req: AppendRequest) -> Result<(AppendResponse, bool)> {
        let reject = |term: u64, conflict_index: u64| AppendResponse {
            term,
            success: false,
            conflict_index,
            match_index: 0,
        };

        if req.term < self.term {
            return Ok((reject(self.term, 0), false));
        }
        if req.term > self.term || self.role != RaftRole::Follower {
            self.step_down(req.term)?;
        }
        self.leader = Some((req.leader_id.clone(), req.leader_addr.clone()));
        self.reset_election_timer();

        // Log matching
        if req.prev_log_index > self.log.last_index() {
            return Ok((reject(self.term, self.log.last_index() + 1), false));
        }
        if req.prev_log_index >= self.log.snapshot_index() {
            match self.log.term(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                Some(term) => {
                    let conflict = self.log.first_index_of_term(req.prev_log_index, term);
                    return Ok((reject(self.term, conflict), false));
                }
                None => return Ok((reject(self.term, self.log.last_index() + 1), false)),
            }
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in req.entries {
            if entry.index <= self.log.snapshot_index() {
                continue;
            }
            if fresh.is_empty() {
                match self.log.term(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        if entry.index <= self.commit_index {
                            return Err(Error::Raft(format!(
                                "leader {} conflicts with committed entry {}",
                                req.leader_id, entry.index
                            )));
                        }
                        self.log.truncate_from(entry.index)?;
                    }
                    None => {}
                }
            }
            fresh.push(entry);
        }
        self.log.append(fresh)?;

        let mut advanced = false;
        let match_index = last_new.max(self.log.snapshot_index());
        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(match_index);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.persist()?;
                METRICS.raft_commit_index.set(commit);
                advanced = true;
            }
        }

        Ok((
            AppendResponse {
                term: self.term,
                success: true,
                conflict_index: 0,
                match_index,
            },
            advanced,
        ))
    }

    /// Handle an InstallSnapshot RPC. Returns the snapshot to restore, if it is news.
    pub fn handle_install_snapshot(
        &mut self,
        req: SnapshotRequest,
    ) -> Result<(SnapshotResponse, Option<Snapshot>)> {
        if req.term < self.term {
            return Ok((SnapshotResponse { term: self.term }, None));
        }
        if req.term > self.term || self.role != RaftRole::Follower {
            self.step_down(req.term)?;
        }
        self.leader = Some((req.leader_id.clone(), req.leader_addr.clone()));
        self.reset_election_timer();

        if req.last_included_index <= self.commit_index {
            return Ok((SnapshotResponse { term: self.term }, None));
        }

        let snapshot = Snapshot {
            index: req.last_included_index,
            term: req.last_included_term,
            data: req.data,
        };
        self.log.apply_snapshot(&snapshot)?;
        self.commit_index = snapshot.index;
        self.persist()?;
        METRICS.raft_commit_index.set(self.commit_index);
        tracing::info!(
            "{} installed snapshot at index {} from {}",
            self.id,
            snapshot.index,
            req.leader_id
        );
        Ok((SnapshotResponse { term: self.term }, Some(snapshot)))
    }

    /// Start an election. Returns the request to broadcast, or `None` if there is no
    /// one to ask (not a voter, or the election was already won).
    pub fn start_election(&mut self) -> Result<Option<VoteRequest>> {
        self.reset_election_timer();
        if !self.voters.contains(&self.id) {
            return Ok(None);
        }

        self.term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.votes = BTreeSet::from([self.id.clone()]);
        self.persist()?;
        METRICS.raft_term.set(self.term);
        METRICS.raft_elections.inc();
        tracing::info!("{} starting election for term {}", self.id, self.term);

        if self.votes.len() >= self.quorum() {
            self.become_leader()?;
            return Ok(None);
        }

        Ok(Some(VoteRequest {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }))
    }

    /// Count a vote. Returns true if this node just became leader.
    pub fn handle_vote_response(
        &mut self,
        election_term: u64,
        from: &str,
        resp: &VoteResponse,
    ) -> Result<bool> {
        if resp.term > self.term {
            self.step_down(resp.term)?;
            return Ok(false);
        }
        if self.role != RaftRole::Candidate || self.term != election_term || !resp.vote_granted {
            return Ok(false);
        }
        self.votes.insert(from.to_string());
        let granted = self.votes.iter().filter(|v| self.voters.contains(*v)).count();
        if granted >= self.quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn become_leader(&mut self) -> Result<()> {
        self.role = RaftRole::Leader;
        self.leader = Some((self.id.clone(), self.addr.clone()));
        self.votes.clear();

        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for (name, _) in self.peers() {
            self.next_index.insert(name.clone(), next);
            self.match_index.insert(name, 0);
        }
        tracing::info!("{} became leader for term {}", self.id, self.term);

        let noop = LogEntry::new(next, self.term, &ClusterCommand::Noop)?;
        self.log.append(vec![noop])?;
        self.advance_commit()?;
        Ok(())
    }

    /// Append a command as leader. Returns (index, term) of the new entry.
    pub fn append_command(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        if !self.is_leader() {
            let leader = self
                .leader
                .as_ref()
                .map(|(_, addr)| addr.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::NotLeader(leader));
        }
        let index = self.log.last_index() + 1;
        self.log.append(vec![LogEntry {
            index,
            term: self.term,
            data,
        }])?;
        METRICS.raft_proposals.inc();
        self.advance_commit()?;
        Ok((index, self.term))
    }

    /// The next request for `peer`, if this node is leader
    pub fn replication_request(&self, peer: &str) -> Result<Option<Replication>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        if next <= self.log.snapshot_index() {
            let Some(snapshot) = self.storage.load_snapshot()? else {
                return Err(Error::Raft(format!(
                    "log compacted through {} but no snapshot stored",
                    self.log.snapshot_index()
                )));
            };
            return Ok(Some(Replication::Snapshot(SnapshotRequest {
                term: self.term,
                leader_id: self.id.clone(),
                leader_addr: self.addr.clone(),
                last_included_index: snapshot.index,
                last_included_term: snapshot.term,
                data: snapshot.data,
            })));
        }

        let prev_log_index = next - 1;
        Ok(Some(Replication::Append(AppendRequest {
            term: self.term,
            leader_id: self.id.clone(),
            leader_addr: self.addr.clone(),
            prev_log_index,
            prev_log_term: self.log.term(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, MAX_ENTRIES_PER_APPEND),
            leader_commit: self.commit_index,
        })))
    }

    /// Whether `peer` is behind the leader's last index
    pub fn has_pending(&self, peer: &str) -> bool {
        self.is_leader()
            && self
                .next_index
                .get(peer)
                .map_or(false, |next| *next <= self.log.last_index())
    }

    /// Handle a peer's AppendEntries answer. Returns true if the commit index moved.
    pub fn handle_append_response(&mut self, peer: &str, resp: &AppendResponse) -> Result<bool> {
        if resp.term > self.term {
            self.step_down(resp.term)?;
            return Ok(false);
        }
        if !self.is_leader() || resp.term < self.term {
            return Ok(false);
        }

        let matched = self.match_index.get(peer).copied().unwrap_or(0);
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        if resp.success {
            let matched = matched.max(resp.match_index);
            self.match_index.insert(peer.to_string(), matched);
            self.next_index
                .insert(peer.to_string(), next.max(matched + 1));
            return self.advance_commit();
        }

        let hint = if resp.conflict_index > 0 {
            resp.conflict_index
        } else {
            next.saturating_sub(1)
        };
        let next = hint.min(next.saturating_sub(1)).max(matched + 1).max(1);
        self.next_index.insert(peer.to_string(), next);
        Ok(false)
    }

    /// Handle a peer's InstallSnapshot answer
    pub fn handle_snapshot_response(
        &mut self,
        peer: &str,
        last_included_index: u64,
        resp: &SnapshotResponse,
    ) -> Result<bool> {
        if resp.term > self.term {
            self.step_down(resp.term)?;
            return Ok(false);
        }
        if !self.is_leader() {
            return Ok(false);
        }
        let matched = self
            .match_index
            .get(peer)
            .copied()
            .unwrap_or(0)
            .max(last_included_index);
        self.match_index.insert(peer.to_string(), matched);
        self.next_index.insert(peer.to_string(), matched + 1);
        self.advance_commit()
    }

    /// Commit the highest current-term index replicated on a majority of voters.
    fn advance_commit(&mut self) -> Result<bool> {
        if !self.is_leader() {
            return Ok(false);
        }
        let quorum = self.quorum();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            if self.log.term(index) != Some(self.term) {
                // earlier terms only commit indirectly
                break;
            }
            let replicated = self
                .voters
                .iter()
                .filter(|v| {
                    **v == self.id || self.match_index.get(*v).map_or(false, |m| *m >= index)
                })
                .count();
            if replicated >= quorum {
                self.commit_index = index;
                self.persist()?;
                METRICS.raft_commit_index.set(index);
                return Ok(true);
            }
            index -= 1;
        }
        Ok(false)
    }

    /// Store a snapshot of the applied state and drop the log prefix it covers
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> Result<()> {
        let Some(term) = self.log.term(index) else {
            return Err(Error::Raft(format!("cannot snapshot at unknown index {}", index)));
        };
        self.log.apply_snapshot(&Snapshot { index, term, data })?;
        tracing::info!("{} compacted raft log through index {}", self.id, index);
        Ok(())
    }

    /// Advance timers
    pub fn tick(&mut self, now: Instant) -> Result<TickAction> {
        match self.role {
            RaftRole::Leader => {
                if now.duration_since(self.last_heartbeat) >= self.timings.heartbeat_interval {
                    self.last_heartbeat = now;
                    return Ok(TickAction::Heartbeat);
                }
                Ok(TickAction::Idle)
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if now < self.election_deadline {
                    return Ok(TickAction::Idle);
                }
                match self.start_election()? {
                    Some(req) => Ok(TickAction::Campaign(req)),
                    None if self.is_leader() => {
                        self.last_heartbeat = now;
                        Ok(TickAction::Heartbeat)
                    }
                    None => Ok(TickAction::Idle),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn timings() -> RaftTimings {
        RaftTimings {
            election_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
        }
    }

    fn node(dir: &TempDir, id: &str, voters: &[&str]) -> RaftNode {
        let storage = Arc::new(RaftStorage::open(dir.path().join(id)).unwrap());
        let mut node = RaftNode::open(id.into(), format!("http://{}", id), storage, timings()).unwrap();
        node.set_membership(
            voters.iter().map(|v| v.to_string()).collect(),
            voters
                .iter()
                .map(|v| (v.to_string(), format!("http://{}", v)))
                .collect(),
        );
        node
    }

    fn noop() -> Vec<u8> {
        bincode::serialize(&ClusterCommand::Noop).unwrap()
    }

    /// Deliver every pending replication from `leader` to `followers` once.
    fn replicate(leader: &mut RaftNode, followers: &mut [&mut RaftNode]) {
        for follower in followers.iter_mut() {
            let id = follower.id().to_string();
            match leader.replication_request(&id).unwrap().unwrap() {
                Replication::Append(req) => {
                    let (resp, _) = follower.handle_append_entries(req).unwrap();
                    leader.handle_append_response(&id, &resp).unwrap();
                }
                Replication::Snapshot(req) => {
                    let index = req.last_included_index;
                    let (resp, _) = follower.handle_install_snapshot(req).unwrap();
                    leader.handle_snapshot_response(&id, index, &resp).unwrap();
                }
            }
        }
    }

    fn elect(candidate: &mut RaftNode, voters: &mut [&mut RaftNode]) {
        let req = candidate.start_election().unwrap().unwrap();
        for voter in voters.iter_mut() {
            let resp = voter.handle_request_vote(&req).unwrap();
            let id = voter.id().to_string();
            candidate.handle_vote_response(req.term, &id, &resp).unwrap();
        }
    }

    #[test]
    fn test_single_voter_elects_itself_and_commits() {
        let dir = tempdir().unwrap();
        let mut a = node(&dir, "a", &["a"]);
        assert!(a.start_election().unwrap().is_none());
        assert!(a.is_leader());
        // the leader's no-op commits immediately
        assert_eq!(a.commit_index(), 1);
        let (index, _) = a.append_command(noop()).unwrap();
        assert_eq!(a.commit_index(), index);
    }

    #[test]
    fn test_vote_rules() {
        let dir = tempdir().unwrap();
        let mut a = node(&dir, "a", &["a", "b", "c"]);
        let req = |term, candidate: &str, last_log_index, last_log_term| VoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index,
            last_log_term,
        };

        assert!(a.handle_request_vote(&req(1, "b", 0, 0)).unwrap().vote_granted);
        // one vote per term
        assert!(!a.handle_request_vote(&req(1, "c", 0, 0)).unwrap().vote_granted);
        // same candidate may ask again
        assert!(a.handle_request_vote(&req(1, "b", 0, 0)).unwrap().vote_granted);
        // stale term is refused
        let resp = a.handle_request_vote(&req(0, "c", 5, 5)).unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 1);

        // a candidate whose log is behind is refused even in a newer term
        a.log.append(vec![LogEntry::new(1, 1, &ClusterCommand::Noop).unwrap()]).unwrap();
        assert!(!a.handle_request_vote(&req(2, "c", 0, 0)).unwrap().vote_granted);
        assert_eq!(a.term(), 2);
        assert!(a.handle_request_vote(&req(2, "c", 1, 1)).unwrap().vote_granted);
    }

    #[test]
    fn test_majority_commit_and_minority_cannot_commit() {
        let dir = tempdir().unwrap();
        let mut a = node(&dir, "a", &["a", "b", "c"]);
        let mut b = node(&dir, "b", &["a", "b", "c"]);
        let mut c = node(&dir, "c", &["a", "b", "c"]);

        elect(&mut a, &mut [&mut b]);
        assert!(a.is_leader());
        assert_eq!(a.commit_index(), 0);

        let (index, _) = a.append_command(noop()).unwrap();
        assert_eq!(a.commit_index(), 0, "nothing commits without a majority");

        replicate(&mut a, &mut [&mut b]);
        assert_eq!(a.commit_index(), index);

        // followers learn the commit index on the next round
        replicate(&mut a, &mut [&mut b, &mut c]);
        assert_eq!(b.commit_index(), index);
        assert_eq!(c.commit_index(), index);
        assert_eq!(c.log().last_index(), index);

        // cut off from both followers, the leader cannot commit new entries
        let (lonely, _) = a.append_command(noop()).unwrap();
        assert!(a.commit_index() < lonely);
    }

    #[test]
    fn test_conflicting_suffix_is_replaced() {
        let dir = tempdir().unwrap();
        let mut a = node(&dir, "a", &["a", "b", "c"]);
        let mut b = node(&dir, "b", &["a", "b", "c"]);
        let mut c = node(&dir, "c", &["a", "b", "c"]);

        // b leads term 1 and writes entries that never reach a majority
        elect(&mut b, &mut [&mut c]);
        replicate(&mut b, &mut [&mut c]);
        b.append_command(noop()).unwrap();
        b.append_command(noop()).unwrap();
        assert_eq!(b.log().last_index(), 3);

        // a wins term 2 with c's vote and overwrites b's uncommitted tail
        elect(&mut a, &mut [&mut c]);
        assert!(a.is_leader());
        for _ in 0..4 {
            replicate(&mut a, &mut [&mut b, &mut c]);
        }
        assert_eq!(b.role(), RaftRole::Follower);
        assert_eq!(b.log().last_index(), a.log().last_index());
        assert_eq!(b.log().last_term(), a.term());
        assert_eq!(b.commit_index(), a.commit_index());
    }

    #[test]
    fn test_lagging_follower_receives_snapshot() {
        let dir = tempdir().unwrap();
        let mut a = node(&dir, "a", &["a", "b"]);
        let mut b = node(&dir, "b", &["a", "b"]);
        elect(&mut a, &mut [&mut b]);

        // b misses everything, then a compacts its log
        a.set_membership(
            BTreeSet::from(["a".to_string()]),
            BTreeMap::from([
                ("a".to_string(), "http://a".to_string()),
                ("b".to_string(), "http://b".to_string()),
            ]),
        );
        for _ in 0..5 {
            a.append_command(noop()).unwrap();
        }
        let commit = a.commit_index();
        a.compact(commit, b"state".to_vec()).unwrap();

        replicate(&mut a, &mut [&mut b]);
        assert_eq!(b.commit_index(), commit);
        assert_eq!(b.log().snapshot_index(), commit);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut a = node(&dir, "a", &["a"]);
            a.start_election().unwrap();
            a.append_command(noop()).unwrap();
        }
        let a = node(&dir, "a", &["a"]);
        assert_eq!(a.term(), 1);
        assert_eq!(a.commit_index(), 2);
        assert_eq!(a.role(), RaftRole::Follower);
    }

    #[test]
    fn test_follower_never_campaigns_until_voter() {
        let dir = tempdir().unwrap();
        let mut a = node(&dir, "a", &[]);
        assert!(a.start_election().unwrap().is_none());
        assert_eq!(a.term(), 0);
        assert!(matches!(
            a.append_command(noop()),
            Err(Error::NotLeader(_))
        ));
    }
}
