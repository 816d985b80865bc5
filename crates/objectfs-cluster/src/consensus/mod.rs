//! Leader election and log replication.
//!
//! The engine keeps an in-memory replicated log and drives the
//! follower/candidate/leader role machine. Quorums are sized from the alive
//! member count, so a minority partition can never elect. All consensus
//! messages ride the gossip socket and arrive through an mpsc inbox fed by
//! the membership receive loop.

pub mod log;
pub mod proposal;

pub use log::{EntryKind, LogEntry, PeerIndexTracker, ReplicatedLog};
pub use proposal::{LeadershipChange, Proposal, ProposalKind, ProposalStatus};

use crate::config::ConsensusConfig;
use crate::error::{ClusterError, Result};
use crate::membership::{Envelope, MembershipService, Payload};
use crate::node::NodeId;
use crate::stats::ClusterStats;
use crate::tasks::Shutdown;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consensus role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts entries from a leader
    Follower,
    /// Collecting votes for leadership
    Candidate,
    /// Replicates the log to followers
    Leader,
}

/// Everything protected by the consensus lock.
struct ConsensusState {
    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    votes_from: HashSet<NodeId>,
    leader: Option<NodeId>,
    log: ReplicatedLog,
    tracker: PeerIndexTracker,
    proposals: HashMap<String, Proposal>,
    last_leader_contact: Instant,
}

impl ConsensusState {
    fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            votes_from: HashSet::new(),
            leader: None,
            log: ReplicatedLog::new(),
            tracker: PeerIndexTracker::new(),
            proposals: HashMap::new(),
            last_leader_contact: Instant::now(),
        }
    }

    /// Adopt a higher term: clear the vote and fall back to follower.
    fn adopt_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.votes_from.clear();
            self.role = Role::Follower;
        }
    }
}

/// Consensus engine.
pub struct ConsensusService {
    local_id: NodeId,

    state: RwLock<ConsensusState>,

    membership: Arc<MembershipService>,

    config: ConsensusConfig,

    counters: Arc<RwLock<ClusterStats>>,

    /// Inbox fed by the gossip receive loop
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Envelope, SocketAddr)>>,

    /// Election jitter, seeded independently of message ids
    jitter: Mutex<StdRng>,

    shutdown: Shutdown,
}

impl ConsensusService {
    /// Create the engine as a term-0 follower.
    pub fn new(
        membership: Arc<MembershipService>,
        config: ConsensusConfig,
        inbox: mpsc::UnboundedReceiver<(Envelope, SocketAddr)>,
        counters: Arc<RwLock<ClusterStats>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            local_id: membership.local_id().clone(),
            state: RwLock::new(ConsensusState::new()),
            membership,
            config,
            counters,
            inbox: tokio::sync::Mutex::new(inbox),
            jitter: Mutex::new(StdRng::from_entropy()),
            shutdown,
        }
    }

    /// Check whether this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.state.read().role == Role::Leader
    }

    /// Current leader, if known.
    ///
    /// Leader claims carry an advisory TTL: a follower that has heard
    /// nothing within it stops reporting the stale leader.
    pub fn leader(&self) -> Option<NodeId> {
        let state = self.state.read();
        if state.role != Role::Leader
            && state.last_leader_contact.elapsed() > self.config.leadership_ttl
        {
            return None;
        }
        state.leader.clone()
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.state.read().role
    }

    /// Current term.
    pub fn current_term(&self) -> u64 {
        self.state.read().current_term
    }

    /// (last index, last term, commit index) of the local log.
    pub fn log_info(&self) -> (u64, u64, u64) {
        let state = self.state.read();
        let (index, term) = state.log.last_info();
        (index, term, state.log.commit_index())
    }

    /// Snapshot of one proposal.
    pub fn proposal(&self, id: &str) -> Option<Proposal> {
        self.state.read().proposals.get(id).cloned()
    }

    /// Forget the current leader (failure-detector callback).
    pub fn clear_leader(&self) {
        let mut state = self.state.write();
        state.leader = None;
        if state.role == Role::Leader {
            state.role = Role::Follower;
        }
    }

    /// Install a leader decided out-of-band (accepted leadership proposal).
    pub fn set_leader(&self, id: NodeId) {
        let peers: Vec<NodeId> = self
            .membership
            .alive_nodes()
            .into_iter()
            .map(|n| n.id)
            .filter(|p| *p != self.local_id)
            .collect();

        let mut state = self.state.write();
        state.leader = Some(id.clone());
        state.last_leader_contact = Instant::now();
        if id == self.local_id {
            state.role = Role::Leader;
            let last_index = state.log.last_index();
            for peer in peers {
                state.tracker.init_peer(peer, last_index);
            }
        } else if state.role == Role::Leader {
            state.role = Role::Follower;
        }
        info!(leader = %id, "leader installed");
    }

    /// Effective randomized election timeout.
    fn election_timeout(&self) -> Duration {
        let base = self
            .config
            .election_timeout
            .unwrap_or(Duration::from_millis(150));
        let jitter_ms = self.jitter.lock().gen_range(0..base.as_millis().max(1) as u64);
        base + Duration::from_millis(jitter_ms)
    }

    /// Alive peers (self excluded) with their transport addresses.
    fn alive_peers(&self) -> Vec<(NodeId, SocketAddr)> {
        self.membership
            .alive_nodes()
            .into_iter()
            .filter(|n| n.id != self.local_id)
            .map(|n| (n.id, n.addr))
            .collect()
    }

    /// Start an election round: bump the term, vote for self, solicit votes.
    pub async fn start_election(&self) {
        let peers = self.alive_peers();
        let quorum = self.membership.quorum();

        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.write();
            state.current_term += 1;
            state.role = Role::Candidate;
            state.voted_for = Some(self.local_id.clone());
            state.votes_from.clear();
            state.votes_from.insert(self.local_id.clone());
            state.leader = None;
            state.last_leader_contact = Instant::now();
            let (index, log_term) = state.log.last_info();
            (state.current_term, index, log_term)
        };

        self.counters.write().record_election();
        info!(term, quorum, "starting election");

        if 1 >= quorum {
            self.become_leader(term).await;
            return;
        }

        for (_, addr) in peers {
            self.membership
                .send(
                    addr,
                    Payload::RequestVote {
                        term,
                        candidate: self.local_id.clone(),
                        last_log_index,
                        last_log_term,
                    },
                )
                .await;
        }
    }

    /// Transition to leader for `term` and fire an immediate heartbeat.
    async fn become_leader(&self, term: u64) {
        let peers = self.alive_peers();

        {
            let mut state = self.state.write();
            if state.role != Role::Candidate || state.current_term != term {
                return;
            }
            state.role = Role::Leader;
            state.leader = Some(self.local_id.clone());
            let last_index = state.log.last_index();
            for (peer, _) in &peers {
                state.tracker.init_peer(peer.clone(), last_index);
            }
            state.log.append(
                term,
                EntryKind::LeaderElection,
                self.local_id.as_str().as_bytes().to_vec(),
            );
        }

        info!(term, "won election, became leader");
        self.broadcast_append_entries().await;
    }

    /// One append-entries round to every alive peer.
    async fn broadcast_append_entries(&self) {
        let peers = self.alive_peers();
        let mut rounds: Vec<(SocketAddr, Payload)> = Vec::new();

        {
            let state = self.state.read();
            if state.role != Role::Leader {
                return;
            }
            for (peer, addr) in &peers {
                let next = state.tracker.next_index(peer);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = state
                    .log
                    .get(prev_log_index)
                    .map(|e| e.term)
                    .unwrap_or(0);
                rounds.push((
                    *addr,
                    Payload::AppendEntries {
                        term: state.current_term,
                        leader: self.local_id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries: state.log.entries_from(next),
                        leader_commit: state.log.commit_index(),
                    },
                ));
            }
        }

        for (addr, payload) in rounds {
            self.membership.send(addr, payload).await;
        }
    }

    /// Submit a cluster-wide proposal. Leader only.
    pub async fn propose_change(&self, kind: ProposalKind, payload: Vec<u8>) -> Result<String> {
        if !self.is_leader() {
            return Err(ClusterError::NotLeader(self.leader()));
        }

        let quorum = self.membership.quorum();
        let peers = self.alive_peers();

        let proposal = Proposal::new(kind, payload, self.local_id.clone());
        let id = proposal.id.clone();
        {
            let mut state = self.state.write();
            state.proposals.insert(id.clone(), proposal.clone());
        }
        debug!(proposal = %id, ?kind, "proposal created");

        if proposal.accept_count() >= quorum {
            self.finalize_proposal(&id, true).await;
            return Ok(id);
        }

        for (_, addr) in peers {
            self.membership
                .send(
                    addr,
                    Payload::ProposeChange {
                        proposal: proposal.clone(),
                    },
                )
                .await;
        }
        Ok(id)
    }

    /// Inbox loop: one exhaustive dispatch per consensus message.
    pub async fn message_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut inbox = self.inbox.lock().await;
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some((envelope, from)) => self.dispatch(envelope, from).await,
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope, from: SocketAddr) {
        let sender = envelope.sender;
        match envelope.payload {
            Payload::RequestVote {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                self.handle_request_vote(candidate, term, last_log_index, last_log_term, from)
                    .await
            }

            Payload::VoteReply { term, granted } => {
                self.handle_vote_reply(sender, term, granted).await;
            }

            Payload::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                self.handle_append_entries(
                    leader,
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                    from,
                )
                .await
            }

            Payload::AppendReply {
                term,
                success,
                match_index,
            } => {
                self.handle_append_reply(sender, term, success, match_index)
                    .await
            }

            Payload::ProposeChange { proposal } => {
                self.handle_propose_change(proposal, from).await;
            }

            Payload::ProposalVote {
                proposal_id,
                accept,
            } => {
                self.handle_proposal_vote(sender, &proposal_id, accept).await;
            }

            other => debug!(kind = other.kind(), "ignoring non-consensus message"),
        }
    }

    async fn handle_request_vote(
        &self,
        candidate: NodeId,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        reply_to: SocketAddr,
    ) {
        let (granted, current_term) = {
            let mut state = self.state.write();
            state.adopt_term(term);

            if term < state.current_term {
                (false, state.current_term)
            } else {
                let free_to_vote = state
                    .voted_for
                    .as_ref()
                    .map(|v| *v == candidate)
                    .unwrap_or(true);
                let up_to_date = state.log.candidate_up_to_date(last_log_index, last_log_term);

                if free_to_vote && up_to_date {
                    state.voted_for = Some(candidate.clone());
                    state.last_leader_contact = Instant::now();
                    (true, state.current_term)
                } else {
                    (false, state.current_term)
                }
            }
        };

        debug!(candidate = %candidate, term, granted, "vote request");
        self.membership
            .send(
                reply_to,
                Payload::VoteReply {
                    term: current_term,
                    granted,
                },
            )
            .await;
    }

    async fn handle_vote_reply(&self, voter: NodeId, term: u64, granted: bool) {
        let quorum = self.membership.quorum();

        let won = {
            let mut state = self.state.write();
            if term > state.current_term {
                state.adopt_term(term);
                return;
            }
            if state.role != Role::Candidate || term != state.current_term || !granted {
                false
            } else {
                // A duplicated reply from the same voter counts once.
                state.votes_from.insert(voter);
                state.votes_from.len() >= quorum
            }
        };

        if won {
            let term = self.current_term();
            self.become_leader(term).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_append_entries(
        &self,
        leader: NodeId,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        reply_to: SocketAddr,
    ) {
        let (reply, applied) = {
            let mut state = self.state.write();
            state.adopt_term(term);

            if term < state.current_term {
                (
                    Payload::AppendReply {
                        term: state.current_term,
                        success: false,
                        match_index: 0,
                    },
                    Vec::new(),
                )
            } else {
                // Valid leader contact for this term.
                if state.role != Role::Follower {
                    state.role = Role::Follower;
                }
                state.leader = Some(leader.clone());
                state.last_leader_contact = Instant::now();

                let consistent = prev_log_index == 0
                    || state
                        .log
                        .get(prev_log_index)
                        .map(|e| e.term == prev_log_term)
                        .unwrap_or(false);

                if !consistent {
                    (
                        Payload::AppendReply {
                            term: state.current_term,
                            success: false,
                            match_index: 0,
                        },
                        Vec::new(),
                    )
                } else {
                    if !entries.is_empty() {
                        state.log.install(entries);
                    }
                    let last_index = state.log.last_index();
                    state.log.advance_commit(leader_commit.min(last_index));
                    let applied = state.log.take_unapplied();
                    (
                        Payload::AppendReply {
                            term: state.current_term,
                            success: true,
                            match_index: last_index,
                        },
                        applied,
                    )
                }
            }
        };

        self.apply_entries(applied);
        self.membership.send(reply_to, reply).await;
    }

    async fn handle_append_reply(
        &self,
        peer: NodeId,
        term: u64,
        success: bool,
        match_index: u64,
    ) {
        let quorum = self.membership.quorum();
        let peer_ids: Vec<NodeId> = self.alive_peers().into_iter().map(|(id, _)| id).collect();

        let applied = {
            let mut state = self.state.write();
            if term > state.current_term {
                state.adopt_term(term);
                return;
            }
            if state.role != Role::Leader {
                return;
            }

            if !success {
                state.tracker.record_failure(&peer);
                return;
            }

            state.tracker.record_success(peer, match_index);

            // Only entries of the current term commit by counting.
            let candidate =
                state
                    .tracker
                    .quorum_match(&peer_ids, state.log.last_index(), quorum);
            let current_term = state.current_term;
            if candidate > state.log.commit_index()
                && state
                    .log
                    .get(candidate)
                    .map(|e| e.term == current_term)
                    .unwrap_or(false)
            {
                state.log.advance_commit(candidate);
                state.log.take_unapplied()
            } else {
                Vec::new()
            }
        };

        self.apply_entries(applied);
    }

    async fn handle_propose_change(&self, proposal: Proposal, reply_to: SocketAddr) {
        // Accept proposals only from the leader we currently follow.
        let accept = {
            let state = self.state.read();
            state.leader.as_ref() == Some(&proposal.proposer)
        };

        let id = proposal.id.clone();
        {
            let mut state = self.state.write();
            state.proposals.entry(id.clone()).or_insert(proposal);
        }

        self.membership
            .send(
                reply_to,
                Payload::ProposalVote {
                    proposal_id: id,
                    accept,
                },
            )
            .await;
    }

    async fn handle_proposal_vote(&self, from: NodeId, proposal_id: &str, accept: bool) {
        let quorum = self.membership.quorum();
        let alive = self.membership.alive_count();

        let decided = {
            let mut state = self.state.write();
            match state.proposals.get_mut(proposal_id) {
                Some(p) if p.status == ProposalStatus::Pending => {
                    p.record_vote(from, accept);
                    if p.accept_count() >= quorum {
                        Some(true)
                    } else if p.reject_count() > alive.saturating_sub(quorum) {
                        Some(false)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(accepted) = decided {
            self.finalize_proposal(proposal_id, accepted).await;
        }
    }

    /// Move a proposal to a terminal status and execute it if accepted.
    async fn finalize_proposal(&self, id: &str, accepted: bool) {
        let to_execute = {
            let mut state = self.state.write();
            match state.proposals.get_mut(id) {
                Some(p) => {
                    p.status = if accepted {
                        ProposalStatus::Accepted
                    } else {
                        ProposalStatus::Rejected
                    };
                    if accepted {
                        Some(p.clone())
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        let Some(proposal) = to_execute else {
            if !accepted {
                info!(proposal = %id, "proposal rejected");
            }
            return;
        };
        info!(proposal = %id, kind = ?proposal.kind, "proposal accepted");

        match proposal.kind {
            ProposalKind::LeadershipChange => {
                match bincode::deserialize::<LeadershipChange>(&proposal.payload) {
                    Ok(change) => {
                        let new_leader = change.new_leader.clone();
                        self.set_leader(change.new_leader);
                        let mut state = self.state.write();
                        if let Some(p) = state.proposals.get_mut(id) {
                            p.result = Some(new_leader.as_str().as_bytes().to_vec());
                        }
                    }
                    Err(e) => warn!(proposal = %id, error = %e, "bad leadership payload"),
                }
            }
            ProposalKind::ConfigChange | ProposalKind::Operation => {
                let kind = if proposal.kind == ProposalKind::ConfigChange {
                    EntryKind::ConfigChange
                } else {
                    EntryKind::Operation
                };
                let mut state = self.state.write();
                if state.role == Role::Leader {
                    let term = state.current_term;
                    let index = state.log.append(term, kind, proposal.payload.clone());
                    if let Some(p) = state.proposals.get_mut(id) {
                        p.result = Some(index.to_be_bytes().to_vec());
                    }
                }
            }
        }
    }

    fn apply_entries(&self, entries: Vec<LogEntry>) {
        for entry in entries {
            debug!(
                index = entry.index,
                term = entry.term,
                kind = ?entry.kind,
                "applying log entry"
            );
        }
    }

    /// Election timer loop with per-round randomized timeouts.
    pub async fn election_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        loop {
            let timeout = self.election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let due = {
                        let state = self.state.read();
                        state.role != Role::Leader
                            && state.last_leader_contact.elapsed() >= timeout
                    };
                    if due {
                        self.start_election().await;
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    }

    /// Heartbeat loop; a no-op unless this node leads.
    pub async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_leader() {
                        self.broadcast_append_entries().await;
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
    }

    /// Discard proposals that outlived their time-to-live.
    pub async fn proposal_cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_proposals(),
                _ = shutdown.wait() => break,
            }
        }
    }

    fn sweep_proposals(&self) {
        let now = Utc::now();
        let ttl = self.config.proposal_ttl;
        let mut state = self.state.write();
        for proposal in state.proposals.values_mut() {
            if proposal.is_expired(now, ttl) {
                warn!(proposal = %proposal.id, "proposal expired");
                proposal.status = ProposalStatus::Expired;
            }
        }
        state
            .proposals
            .retain(|_, p| !p.status.is_terminal() || !p.is_past_retention(now, ttl));
    }

    /// Periodic role/log snapshot, logged at debug.
    pub async fn stats_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = self.state.read();
                    debug!(
                        role = ?state.role,
                        term = state.current_term,
                        log_len = state.log.len(),
                        commit = state.log.commit_index(),
                        proposals = state.proposals.len(),
                        "consensus stats"
                    );
                }
                _ = shutdown.wait() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use crate::membership::GossipTransport;
    use crate::node::{NodeDescriptor, NodeStatus};

    struct Fixture {
        consensus: Arc<ConsensusService>,
        membership: Arc<MembershipService>,
    }

    async fn fixture(local: &str) -> Fixture {
        let transport = Arc::new(
            GossipTransport::bind("127.0.0.1:0".parse().unwrap(), NodeId::new(local), 4096)
                .await
                .unwrap(),
        );
        let addr = transport.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(RwLock::new(ClusterStats::default()));
        let shutdown = Shutdown::new();
        let membership = Arc::new(MembershipService::new(
            NodeDescriptor::new(NodeId::new(local), addr),
            GossipConfig::default(),
            Vec::new(),
            Duration::from_secs(1),
            transport,
            tx,
            Arc::clone(&counters),
            shutdown.clone(),
        ));
        let consensus = Arc::new(ConsensusService::new(
            Arc::clone(&membership),
            ConsensusConfig {
                election_timeout: Some(Duration::from_millis(50)),
                heartbeat_interval: Duration::from_millis(20),
                ..ConsensusConfig::default()
            },
            rx,
            counters,
            shutdown,
        ));
        Fixture {
            consensus,
            membership,
        }
    }

    fn alive_peer(id: &str, port: u16) -> NodeDescriptor {
        NodeDescriptor::new(
            NodeId::new(id),
            format!("127.0.0.1:{}", port).parse().unwrap(),
        )
        .with_status(NodeStatus::Alive)
    }

    fn reply_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[tokio::test]
    async fn test_single_node_elects_immediately() {
        let f = fixture("n1").await;
        assert_eq!(f.consensus.role(), Role::Follower);
        assert_eq!(f.consensus.current_term(), 0);

        f.consensus.start_election().await;

        assert!(f.consensus.is_leader());
        assert_eq!(f.consensus.current_term(), 1);
        assert_eq!(f.consensus.leader(), Some(NodeId::new("n1")));
        // The leader-election entry is appended on transition.
        let (last_index, last_term, _) = f.consensus.log_info();
        assert_eq!((last_index, last_term), (1, 1));
    }

    #[tokio::test]
    async fn test_election_with_one_dead_peer_uses_alive_quorum() {
        let f = fixture("n1").await;
        f.membership.update_node(alive_peer("n2", 9102));
        f.membership.mark_dead(&NodeId::new("n2"));

        // Two known nodes, one dead: quorum is 1 of 1 alive.
        f.consensus.start_election().await;
        assert!(f.consensus.is_leader());
    }

    #[tokio::test]
    async fn test_candidate_becomes_leader_at_quorum() {
        let f = fixture("n1").await;
        f.membership.update_node(alive_peer("n2", 9102));
        f.membership.update_node(alive_peer("n3", 9103));

        f.consensus.start_election().await;
        assert_eq!(f.consensus.role(), Role::Candidate);

        // One grant plus the self vote reaches quorum 2 of 3.
        f.consensus
            .handle_vote_reply(NodeId::new("n2"), 1, true)
            .await;
        assert!(f.consensus.is_leader());
    }

    #[tokio::test]
    async fn test_vote_denied_for_stale_log() {
        let f = fixture("n1").await;
        {
            let mut state = f.consensus.state.write();
            state.current_term = 2;
            state.log.append(2, EntryKind::Operation, vec![1]);
        }

        // Candidate log at (0, 0) is behind ours.
        f.consensus
            .handle_request_vote(NodeId::new("n2"), 3, 0, 0, reply_addr())
            .await;
        assert_eq!(f.consensus.state.read().voted_for, None);

        // An up-to-date candidate gets the vote in the same term.
        f.consensus
            .handle_request_vote(NodeId::new("n3"), 3, 1, 2, reply_addr())
            .await;
        assert_eq!(
            f.consensus.state.read().voted_for,
            Some(NodeId::new("n3"))
        );
    }

    #[tokio::test]
    async fn test_one_vote_per_term() {
        let f = fixture("n1").await;

        f.consensus
            .handle_request_vote(NodeId::new("n2"), 1, 0, 0, reply_addr())
            .await;
        assert_eq!(
            f.consensus.state.read().voted_for,
            Some(NodeId::new("n2"))
        );

        // Different candidate, same term: vote stays with n2.
        f.consensus
            .handle_request_vote(NodeId::new("n3"), 1, 0, 0, reply_addr())
            .await;
        assert_eq!(
            f.consensus.state.read().voted_for,
            Some(NodeId::new("n2"))
        );
    }

    #[tokio::test]
    async fn test_higher_term_steps_leader_down() {
        let f = fixture("n1").await;
        f.consensus.start_election().await;
        assert!(f.consensus.is_leader());

        f.consensus
            .handle_append_entries(
                NodeId::new("n2"),
                5,
                0,
                0,
                Vec::new(),
                0,
                reply_addr(),
            )
            .await;

        assert_eq!(f.consensus.role(), Role::Follower);
        assert_eq!(f.consensus.current_term(), 5);
        assert_eq!(f.consensus.leader(), Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn test_append_rejected_on_prev_mismatch() {
        let f = fixture("n1").await;

        // Leader claims prev entry (3, term 2) that we do not have.
        f.consensus
            .handle_append_entries(
                NodeId::new("n2"),
                2,
                3,
                2,
                vec![LogEntry::new(2, 4, EntryKind::Operation, vec![1])],
                0,
                reply_addr(),
            )
            .await;

        let (last_index, _, _) = f.consensus.log_info();
        assert_eq!(last_index, 0);
    }

    #[tokio::test]
    async fn test_append_installs_and_commits() {
        let f = fixture("n1").await;

        f.consensus
            .handle_append_entries(
                NodeId::new("n2"),
                1,
                0,
                0,
                vec![
                    LogEntry::new(1, 1, EntryKind::Operation, vec![1]),
                    LogEntry::new(1, 2, EntryKind::Operation, vec![2]),
                ],
                2,
                reply_addr(),
            )
            .await;

        let (last_index, last_term, commit) = f.consensus.log_info();
        assert_eq!((last_index, last_term), (2, 1));
        assert_eq!(commit, 2);
        let state = f.consensus.state.read();
        assert!(state.log.last_applied() <= state.log.commit_index());
        assert_eq!(state.log.last_applied(), 2);
    }

    #[tokio::test]
    async fn test_leader_commit_requires_alive_majority() {
        let f = fixture("n1").await;
        f.membership.update_node(alive_peer("n2", 9102));
        f.membership.update_node(alive_peer("n3", 9103));

        f.consensus.start_election().await;
        f.consensus
            .handle_vote_reply(NodeId::new("n2"), 1, true)
            .await;
        assert!(f.consensus.is_leader());

        // Leader-election entry sits at index 1; not yet replicated.
        assert_eq!(f.consensus.log_info().2, 0);

        // One follower acks index 1: 2 of 3 alive have it, commit advances.
        f.consensus
            .handle_append_reply(NodeId::new("n2"), 1, true, 1)
            .await;
        assert_eq!(f.consensus.log_info().2, 1);
    }

    #[tokio::test]
    async fn test_failed_append_reply_backs_off_next_index() {
        let f = fixture("n1").await;
        f.membership.update_node(alive_peer("n2", 9102));
        f.membership.update_node(alive_peer("n3", 9103));

        f.consensus.start_election().await;
        f.consensus
            .handle_vote_reply(NodeId::new("n2"), 1, true)
            .await;

        // A success moves next-index to 2; the failure retries one earlier.
        f.consensus
            .handle_append_reply(NodeId::new("n2"), 1, true, 1)
            .await;
        assert_eq!(
            f.consensus
                .state
                .read()
                .tracker
                .next_index(&NodeId::new("n2")),
            2
        );
        f.consensus
            .handle_append_reply(NodeId::new("n2"), 1, false, 0)
            .await;
        assert_eq!(
            f.consensus
                .state
                .read()
                .tracker
                .next_index(&NodeId::new("n2")),
            1
        );
    }

    #[tokio::test]
    async fn test_propose_requires_leadership() {
        let f = fixture("n1").await;
        let err = f
            .consensus
            .propose_change(ProposalKind::ConfigChange, vec![1])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader(_)));
    }

    #[tokio::test]
    async fn test_leadership_proposal_executes_on_quorum() {
        let f = fixture("n1").await;
        f.membership.update_node(alive_peer("n2", 9102));
        f.membership.update_node(alive_peer("n3", 9103));

        f.consensus.start_election().await;
        f.consensus
            .handle_vote_reply(NodeId::new("n2"), 1, true)
            .await;
        assert!(f.consensus.is_leader());

        let payload = bincode::serialize(&LeadershipChange {
            new_leader: NodeId::new("n2"),
        })
        .unwrap();
        let id = f
            .consensus
            .propose_change(ProposalKind::LeadershipChange, payload)
            .await
            .unwrap();
        assert_eq!(
            f.consensus.proposal(&id).unwrap().status,
            ProposalStatus::Pending
        );

        // One accepting peer vote reaches the alive majority of 2.
        f.consensus
            .handle_proposal_vote(NodeId::new("n2"), &id, true)
            .await;

        let proposal = f.consensus.proposal(&id).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Accepted);
        assert_eq!(f.consensus.leader(), Some(NodeId::new("n2")));
        assert!(!f.consensus.is_leader());
    }

    #[tokio::test]
    async fn test_pending_proposal_expires() {
        let f = fixture("n1").await;
        f.membership.update_node(alive_peer("n2", 9102));
        f.membership.update_node(alive_peer("n3", 9103));

        f.consensus.start_election().await;
        f.consensus
            .handle_vote_reply(NodeId::new("n2"), 1, true)
            .await;

        let id = f
            .consensus
            .propose_change(ProposalKind::Operation, vec![7])
            .await
            .unwrap();

        // Backdate the proposal past its time-to-live, then sweep.
        {
            let mut state = f.consensus.state.write();
            let p = state.proposals.get_mut(&id).unwrap();
            p.created_at = Utc::now() - chrono::Duration::seconds(31);
        }
        f.consensus.sweep_proposals();
        assert!(f.consensus.proposal(&id).is_none());
    }

    #[tokio::test]
    async fn test_election_loop_elects_single_node() {
        let f = fixture("n1").await;
        let consensus = Arc::clone(&f.consensus);
        tokio::spawn(consensus.election_loop());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !f.consensus.is_leader() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("single node should elect itself");
    }
}
