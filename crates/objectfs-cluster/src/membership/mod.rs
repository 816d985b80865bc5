//! Cluster membership and failure detection.
//!
//! The membership service owns the authoritative table of peer nodes. Every
//! state transition is driven by (node id, incarnation) monotonicity so that
//! duplicated or reordered datagrams converge to the same table.

pub mod record;
pub mod transport;

pub use record::{GossipRecord, GossipState, Suspicion};
pub use transport::{Envelope, GossipTransport, Payload, PROTOCOL_VERSION};

use crate::config::GossipConfig;
use crate::error::Result;
use crate::node::{NodeDescriptor, NodeId, NodeStatus};
use crate::stats::ClusterStats;
use crate::tasks::Shutdown;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Gossip-level counters, owned by the membership service.
#[derive(Debug, Clone, Default)]
pub struct GossipStats {
    /// Outbound gossip rounds completed
    pub rounds: u64,

    /// Full syncs sent in response to joins
    pub syncs_sent: u64,

    /// Suspicions opened locally
    pub suspicions_opened: u64,

    /// Nodes this node declared dead
    pub deaths_declared: u64,
}

/// Membership service managing the gossip table and failure detection.
pub struct MembershipService {
    local_id: NodeId,

    /// Authoritative gossip table, local record included
    table: Arc<RwLock<HashMap<NodeId, GossipRecord>>>,

    /// Incarnation owned by this node
    incarnation: AtomicU64,

    transport: Arc<GossipTransport>,

    config: GossipConfig,

    seed_nodes: Vec<SocketAddr>,

    join_timeout: Duration,

    /// Inbox of the consensus engine; consensus kinds are forwarded here
    consensus_tx: mpsc::UnboundedSender<(Envelope, SocketAddr)>,

    /// Cluster-wide counters (dedicated lock, never nested under the table)
    counters: Arc<RwLock<ClusterStats>>,

    stats: Arc<RwLock<GossipStats>>,

    /// Peer selection randomness, seeded independently of message ids
    rng: Mutex<StdRng>,

    shutdown: Shutdown,
}

impl MembershipService {
    /// Create the service and install the local node as alive.
    pub fn new(
        local: NodeDescriptor,
        config: GossipConfig,
        seed_nodes: Vec<SocketAddr>,
        join_timeout: Duration,
        transport: Arc<GossipTransport>,
        consensus_tx: mpsc::UnboundedSender<(Envelope, SocketAddr)>,
        counters: Arc<RwLock<ClusterStats>>,
        shutdown: Shutdown,
    ) -> Self {
        let local_id = local.id.clone();
        let mut table = HashMap::new();
        let mut local_record = GossipRecord::new(local, 0);
        local_record.mark(GossipState::Alive);
        table.insert(local_id.clone(), local_record);

        Self {
            local_id,
            table: Arc::new(RwLock::new(table)),
            incarnation: AtomicU64::new(0),
            transport,
            config,
            seed_nodes,
            join_timeout,
            consensus_tx,
            counters,
            stats: Arc::new(RwLock::new(GossipStats::default())),
            rng: Mutex::new(StdRng::from_entropy()),
            shutdown,
        }
    }

    /// Local node identifier.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Current incarnation of the local node.
    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Deep copy of the node table.
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        self.table.read().values().map(|r| r.node.clone()).collect()
    }

    /// Deep copy of the gossip records.
    pub fn records(&self) -> Vec<GossipRecord> {
        self.table.read().values().cloned().collect()
    }

    /// Descriptor for one node.
    pub fn get(&self, id: &NodeId) -> Option<NodeDescriptor> {
        self.table.read().get(id).map(|r| r.node.clone())
    }

    /// All alive nodes, self included.
    pub fn alive_nodes(&self) -> Vec<NodeDescriptor> {
        self.table
            .read()
            .values()
            .filter(|r| r.node.status.is_alive())
            .map(|r| r.node.clone())
            .collect()
    }

    /// Count of alive nodes, self included.
    pub fn alive_count(&self) -> usize {
        self.table
            .read()
            .values()
            .filter(|r| r.node.status.is_alive())
            .count()
    }

    /// Majority over the alive member count.
    pub fn quorum(&self) -> usize {
        self.alive_count() / 2 + 1
    }

    /// Gossip snapshot.
    pub fn stats(&self) -> GossipStats {
        self.stats.read().clone()
    }

    /// Merge a peer-reported descriptor into the table (soft fields only).
    pub fn update_node(&self, descriptor: NodeDescriptor) {
        let mut table = self.table.write();
        match table.get_mut(&descriptor.id) {
            Some(rec) => {
                rec.node.resources = descriptor.resources;
                rec.node.metadata = descriptor.metadata;
                rec.node.version = descriptor.version;
                rec.node.touch();
            }
            None => {
                let id = descriptor.id.clone();
                table.insert(id, GossipRecord::new(descriptor, 0));
            }
        }
    }

    /// Remove a node outright.
    pub fn remove_node(&self, id: &NodeId) -> bool {
        if id == &self.local_id {
            return false;
        }
        self.table.write().remove(id).is_some()
    }

    /// Mark a node suspect (failure-detector policy). Returns true when the
    /// state actually changed.
    pub fn mark_suspect(&self, id: &NodeId) -> bool {
        let mut table = self.table.write();
        match table.get_mut(id) {
            Some(rec) if rec.state == GossipState::Alive => {
                let incarnation = rec.incarnation;
                rec.mark(GossipState::Suspect);
                rec.suspicion = Some(Suspicion::new(
                    incarnation,
                    self.local_id.clone(),
                    self.config.suspicion_timeout,
                ));
                true
            }
            _ => false,
        }
    }

    /// Mark a node dead (failure-detector policy). Returns true when the
    /// state actually changed.
    pub fn mark_dead(&self, id: &NodeId) -> bool {
        let mut table = self.table.write();
        match table.get_mut(id) {
            Some(rec) if rec.state != GossipState::Dead => {
                rec.mark(GossipState::Dead);
                rec.suspicion = None;
                true
            }
            _ => false,
        }
    }

    /// Test hook: age a node's timestamps by `seconds`.
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &NodeId, seconds: i64) {
        let mut table = self.table.write();
        if let Some(rec) = table.get_mut(id) {
            let delta = chrono::Duration::seconds(seconds);
            rec.node.last_seen = rec.node.last_seen - delta;
            rec.state_changed_at = rec.state_changed_at - delta;
            if let Some(suspicion) = rec.suspicion.as_mut() {
                suspicion.deadline = suspicion.deadline - delta;
            }
        }
    }

    /// Contact every configured seed and wait for the first peer to appear.
    pub async fn join_seeds(&self) -> Result<()> {
        let local = self.local_descriptor();
        let seeds: Vec<SocketAddr> = self
            .seed_nodes
            .iter()
            .filter(|&&addr| addr != local.addr)
            .copied()
            .collect();
        if seeds.is_empty() {
            return Ok(());
        }

        let incarnation = self.incarnation();
        for seed in &seeds {
            let payload = Payload::Join {
                node: local.clone(),
                incarnation,
            };
            self.send(*seed, payload).await;
        }

        // Seeds answer with a full sync; poll until one lands.
        let deadline = tokio::time::Instant::now() + self.join_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.table.read().len() > 1 {
                info!("joined cluster via seed nodes");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        warn!("no seed node answered within the join timeout");
        Ok(())
    }

    /// Announce a graceful departure.
    pub async fn leave(&self) {
        let targets = self.gossip_targets();
        for addr in targets {
            self.send(addr, Payload::Leave).await;
        }
    }

    /// Handle one inbound envelope.
    pub async fn handle_envelope(&self, envelope: Envelope, from: SocketAddr) -> Result<()> {
        if envelope.payload.is_consensus() {
            let _ = self.consensus_tx.send((envelope, from));
            return Ok(());
        }

        debug!(
            kind = envelope.payload.kind(),
            sender = %envelope.sender,
            "gossip message"
        );

        match envelope.payload {
            Payload::Join { node, incarnation } => self.handle_join(node, incarnation, from).await,

            Payload::Leave => {
                self.handle_leave(&envelope.sender);
                Ok(())
            }

            Payload::Alive { node, incarnation } => {
                self.handle_alive(node, incarnation);
                Ok(())
            }

            Payload::Suspect {
                target,
                incarnation,
                from: accuser,
            } => self.handle_suspect(target, incarnation, accuser).await,

            Payload::Dead {
                target,
                incarnation,
                ..
            } => self.handle_dead(target, incarnation).await,

            Payload::Sync { records } => {
                self.handle_sync(records);
                Ok(())
            }

            Payload::Heartbeat { incarnation } => {
                self.handle_heartbeat(&envelope.sender, incarnation);
                Ok(())
            }

            // Consensus kinds were forwarded above.
            _ => Ok(()),
        }
    }

    async fn handle_join(
        &self,
        mut node: NodeDescriptor,
        incarnation: u64,
        from: SocketAddr,
    ) -> Result<()> {
        if node.id == self.local_id {
            return Ok(());
        }

        info!(node = %node.id, addr = %node.addr, "node joining");
        node.status = NodeStatus::Alive;
        node.touch();

        {
            let mut table = self.table.write();
            match table.get_mut(&node.id) {
                Some(rec) if incarnation >= rec.incarnation => {
                    rec.node = node.clone();
                    rec.incarnation = incarnation;
                    rec.suspicion = None;
                    rec.mark(GossipState::Alive);
                }
                Some(_) => return Ok(()),
                None => {
                    table.insert(node.id.clone(), GossipRecord::new(node.clone(), incarnation));
                }
            }
        }

        // Answer with our full view so the joiner converges in one round.
        let records = self.records();
        match self.transport.send_sync(from, records).await {
            Ok(bytes) => {
                self.counters.write().record_sent(bytes);
                self.stats.write().syncs_sent += 1;
            }
            Err(e) => {
                warn!(error = %e, "failed to answer join with sync");
                self.counters.write().record_network_error();
            }
        }
        Ok(())
    }

    fn handle_leave(&self, id: &NodeId) {
        if id == &self.local_id {
            return;
        }
        let mut table = self.table.write();
        if let Some(rec) = table.get_mut(id) {
            info!(node = %id, "node leaving");
            rec.suspicion = None;
            rec.mark(GossipState::Left);
        }
    }

    fn handle_alive(&self, node: NodeDescriptor, incarnation: u64) {
        if node.id == self.local_id {
            return;
        }

        let mut table = self.table.write();
        match table.get_mut(&node.id) {
            Some(rec) => {
                if incarnation > rec.incarnation {
                    rec.node = node;
                    rec.node.touch();
                    rec.incarnation = incarnation;
                    rec.suspicion = None;
                    rec.mark(GossipState::Alive);
                }
            }
            None => {
                let mut rec = GossipRecord::new(node, incarnation);
                rec.node.touch();
                rec.mark(GossipState::Alive);
                table.insert(rec.node.id.clone(), rec);
            }
        }
    }

    async fn handle_suspect(&self, target: NodeId, incarnation: u64, accuser: NodeId) -> Result<()> {
        if target == self.local_id {
            // Somebody thinks we are gone; refute with a fresh incarnation.
            let refuted = self.refute(incarnation);
            debug!(incarnation = refuted, "refuting suspicion about self");
            self.announce_alive().await;
            return Ok(());
        }

        let mut opened = false;
        {
            let mut table = self.table.write();
            if let Some(rec) = table.get_mut(&target) {
                if rec.state == GossipState::Alive && rec.incarnation == incarnation {
                    rec.mark(GossipState::Suspect);
                    rec.suspicion = Some(Suspicion::new(
                        incarnation,
                        accuser,
                        self.config.suspicion_timeout,
                    ));
                    opened = true;
                } else if rec.state == GossipState::Suspect {
                    if let Some(suspicion) = rec.suspicion.as_mut() {
                        if suspicion.incarnation == incarnation {
                            suspicion.accusers.insert(accuser);
                        }
                    }
                }
            }
        }
        if opened {
            self.stats.write().suspicions_opened += 1;
        }
        Ok(())
    }

    async fn handle_dead(&self, target: NodeId, incarnation: u64) -> Result<()> {
        if target == self.local_id {
            // Dead is terminal only until the owner re-announces.
            let refuted = self.refute(incarnation);
            debug!(incarnation = refuted, "refuting death claim about self");
            self.announce_alive().await;
            return Ok(());
        }

        let mut table = self.table.write();
        if let Some(rec) = table.get_mut(&target) {
            if incarnation >= rec.incarnation && rec.state != GossipState::Dead {
                warn!(node = %target, "node declared dead");
                rec.incarnation = rec.incarnation.max(incarnation);
                rec.suspicion = None;
                rec.mark(GossipState::Dead);
            }
        }
        Ok(())
    }

    fn handle_sync(&self, records: Vec<GossipRecord>) {
        let mut table = self.table.write();
        for incoming in records {
            if incoming.node.id == self.local_id {
                continue;
            }
            match table.get_mut(&incoming.node.id) {
                Some(rec) => {
                    if incoming.incarnation > rec.incarnation {
                        *rec = incoming;
                    }
                }
                None => {
                    table.insert(incoming.node.id.clone(), incoming);
                }
            }
        }
    }

    fn handle_heartbeat(&self, sender: &NodeId, incarnation: u64) {
        let mut table = self.table.write();
        if let Some(rec) = table.get_mut(sender) {
            rec.node.touch();
            if rec.state == GossipState::Suspect && incarnation >= rec.incarnation {
                rec.suspicion = None;
                rec.mark(GossipState::Alive);
            }
        }
    }

    /// Bump the local incarnation above `observed` and mirror it into the
    /// table. Only the owner ever bumps its incarnation.
    fn refute(&self, observed: u64) -> u64 {
        let mut current = self.incarnation.load(Ordering::SeqCst);
        loop {
            let next = current.max(observed) + 1;
            match self.incarnation.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let mut table = self.table.write();
                    if let Some(rec) = table.get_mut(&self.local_id) {
                        rec.incarnation = next;
                        rec.suspicion = None;
                        rec.mark(GossipState::Alive);
                    }
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn local_descriptor(&self) -> NodeDescriptor {
        self.table
            .read()
            .get(&self.local_id)
            .map(|r| r.node.clone())
            .expect("local record always present")
    }

    /// Addresses of peers that should still receive gossip traffic.
    fn gossip_targets(&self) -> Vec<SocketAddr> {
        self.table
            .read()
            .values()
            .filter(|r| r.node.id != self.local_id && r.state.is_gossipable())
            .map(|r| r.node.addr)
            .collect()
    }

    async fn announce_alive(&self) {
        let node = self.local_descriptor();
        let incarnation = self.incarnation();
        for addr in self.gossip_targets() {
            self.send(addr, Payload::Alive {
                node: node.clone(),
                incarnation,
            })
            .await;
        }
    }

    /// Send one payload, routing errors into the counters.
    pub async fn send(&self, addr: SocketAddr, payload: Payload) {
        match self.transport.send(addr, payload).await {
            Ok(bytes) => self.counters.write().record_sent(bytes),
            Err(e) => {
                debug!(error = %e, addr = %addr, "gossip send failed");
                self.counters.write().record_network_error();
            }
        }
    }

    /// Blocking receive loop. Owns the only read side of the socket.
    pub async fn receiver_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        loop {
            tokio::select! {
                result = self.transport.recv() => match result {
                    Ok((envelope, addr, bytes)) => {
                        self.counters.write().record_received(bytes);
                        if let Err(e) = self.handle_envelope(envelope, addr).await {
                            debug!(error = %e, "failed to handle gossip message");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "dropping malformed datagram");
                        self.counters.write().record_network_error();
                    }
                },
                _ = shutdown.wait() => break,
            }
        }
    }

    /// Outbound gossip loop: fanout alive announcements plus a heartbeat
    /// broadcast, every gossip interval.
    pub async fn gossip_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.gossip_round().await,
                _ = shutdown.wait() => break,
            }
        }
    }

    async fn gossip_round(&self) {
        let node = self.local_descriptor();
        let incarnation = self.incarnation();

        let mut targets = self.gossip_targets();
        {
            let mut rng = self.rng.lock();
            targets.shuffle(&mut *rng);
        }

        for addr in targets.iter().take(self.config.gossip_fanout) {
            self.send(*addr, Payload::Alive {
                node: node.clone(),
                incarnation,
            })
            .await;
        }

        for addr in &targets {
            self.send(*addr, Payload::Heartbeat { incarnation }).await;
        }

        // Anti-entropy: one random peer per round gets the full view, so
        // nodes discovered through different seeds still converge.
        if let Some(addr) = targets.first() {
            let records = self.records();
            match self.transport.send_sync(*addr, records).await {
                Ok(bytes) => self.counters.write().record_sent(bytes),
                Err(e) => {
                    debug!(error = %e, "anti-entropy sync failed");
                    self.counters.write().record_network_error();
                }
            }
        }

        self.stats.write().rounds += 1;
    }

    /// Suspicion timer: escalates expired suspicions to dead and reaps
    /// departed nodes after the leave grace.
    pub async fn suspicion_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_suspicions().await,
                _ = shutdown.wait() => break,
            }
        }
    }

    async fn sweep_suspicions(&self) {
        let now = Utc::now();
        let mut deaths: Vec<(NodeId, u64)> = Vec::new();

        {
            let mut table = self.table.write();
            for rec in table.values_mut() {
                let expired = rec
                    .suspicion
                    .as_ref()
                    .map(|s| s.is_expired(now))
                    .unwrap_or(false);
                if rec.state == GossipState::Suspect && expired {
                    rec.suspicion = None;
                    rec.mark(GossipState::Dead);
                    deaths.push((rec.node.id.clone(), rec.incarnation));
                }
            }
            let grace = self.config.leave_grace;
            table.retain(|_, rec| !(rec.state == GossipState::Left && rec.state_age(now) > grace));
        }

        for (target, incarnation) in deaths {
            warn!(node = %target, "suspicion expired, declaring dead");
            self.stats.write().deaths_declared += 1;
            let payload = Payload::Dead {
                target: target.clone(),
                incarnation,
                from: self.local_id.clone(),
            };
            for addr in self.gossip_targets() {
                self.send(addr, payload.clone()).await;
            }
        }
    }

    /// Periodic stats snapshot, logged at debug.
    pub async fn stats_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.stats.read().clone();
                    debug!(
                        members = self.table.read().len(),
                        alive = self.alive_count(),
                        rounds = stats.rounds,
                        "gossip stats"
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
    use crate::node::NodeDescriptor;

    async fn service() -> (Arc<MembershipService>, mpsc::UnboundedReceiver<(Envelope, SocketAddr)>) {
        let transport = Arc::new(
            GossipTransport::bind("127.0.0.1:0".parse().unwrap(), NodeId::new("local"), 1024)
                .await
                .unwrap(),
        );
        let addr = transport.local_addr().unwrap();
        let local = NodeDescriptor::new(NodeId::new("local"), addr);
        let (tx, rx) = mpsc::unbounded_channel();
        let svc = MembershipService::new(
            local,
            GossipConfig::default(),
            Vec::new(),
            Duration::from_secs(1),
            transport,
            tx,
            Arc::new(RwLock::new(ClusterStats::default())),
            Shutdown::new(),
        );
        (Arc::new(svc), rx)
    }

    fn envelope(sender: &str, payload: Payload) -> Envelope {
        Envelope::new(NodeId::new(sender), payload)
    }

    fn peer(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::new(id), "127.0.0.1:9100".parse().unwrap())
    }

    fn source() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[tokio::test]
    async fn test_alive_installs_and_is_idempotent() {
        let (svc, _rx) = service().await;

        let payload = Payload::Alive {
            node: peer("p1"),
            incarnation: 2,
        };
        svc.handle_envelope(envelope("p1", payload.clone()), source())
            .await
            .unwrap();
        assert_eq!(svc.alive_count(), 2);

        let before: Vec<_> = svc
            .records()
            .into_iter()
            .map(|r| (r.node.id.clone(), r.incarnation, r.state))
            .collect();

        // Receiving the same record again changes nothing.
        svc.handle_envelope(envelope("p1", payload), source())
            .await
            .unwrap();
        let after: Vec<_> = svc
            .records()
            .into_iter()
            .map(|r| (r.node.id.clone(), r.incarnation, r.state))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_stale_alive_is_ignored() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 5 }),
            source(),
        )
        .await
        .unwrap();
        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();

        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.incarnation, 5);
    }

    #[tokio::test]
    async fn test_suspect_then_refuting_alive() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();

        // Accusation at the current incarnation opens a suspicion.
        svc.handle_envelope(
            envelope(
                "p2",
                Payload::Suspect {
                    target: NodeId::new("p1"),
                    incarnation: 3,
                    from: NodeId::new("p2"),
                },
            ),
            source(),
        )
        .await
        .unwrap();
        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Suspect);
        assert!(rec.suspicion.is_some());

        // A strictly greater alive claim restores the node and erases
        // the suspicion.
        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 4 }),
            source(),
        )
        .await
        .unwrap();
        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Alive);
        assert!(rec.suspicion.is_none());
        assert_eq!(rec.incarnation, 4);
    }

    #[tokio::test]
    async fn test_suspect_wrong_incarnation_is_ignored() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();
        svc.handle_envelope(
            envelope(
                "p2",
                Payload::Suspect {
                    target: NodeId::new("p1"),
                    incarnation: 2,
                    from: NodeId::new("p2"),
                },
            ),
            source(),
        )
        .await
        .unwrap();

        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Alive);
    }

    #[tokio::test]
    async fn test_dead_is_idempotent_and_terminal() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();

        let dead = Payload::Dead {
            target: NodeId::new("p1"),
            incarnation: 3,
            from: NodeId::new("p2"),
        };
        svc.handle_envelope(envelope("p2", dead.clone()), source())
            .await
            .unwrap();
        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Dead);

        // Duplicate dead record is a no-op.
        svc.handle_envelope(envelope("p2", dead), source())
            .await
            .unwrap();
        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Dead);

        // A stale alive cannot resurrect it; a greater incarnation can.
        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();
        assert_eq!(
            svc.records()
                .into_iter()
                .find(|r| r.node.id == NodeId::new("p1"))
                .unwrap()
                .state,
            GossipState::Dead
        );
        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 4 }),
            source(),
        )
        .await
        .unwrap();
        assert_eq!(
            svc.records()
                .into_iter()
                .find(|r| r.node.id == NodeId::new("p1"))
                .unwrap()
                .state,
            GossipState::Alive
        );
    }

    #[tokio::test]
    async fn test_self_suspicion_is_refuted() {
        let (svc, _rx) = service().await;
        assert_eq!(svc.incarnation(), 0);

        svc.handle_envelope(
            envelope(
                "p2",
                Payload::Suspect {
                    target: NodeId::new("local"),
                    incarnation: 0,
                    from: NodeId::new("p2"),
                },
            ),
            source(),
        )
        .await
        .unwrap();

        assert!(svc.incarnation() > 0);
        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("local"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Alive);
    }

    #[tokio::test]
    async fn test_sync_installs_strictly_newer() {
        let (svc, _rx) = service().await;

        let mut old = GossipRecord::new(peer("p1"), 1);
        old.mark(GossipState::Alive);
        svc.handle_envelope(
            envelope("p2", Payload::Sync { records: vec![old] }),
            source(),
        )
        .await
        .unwrap();
        assert!(svc.get(&NodeId::new("p1")).is_some());

        // Equal incarnation does not overwrite.
        let mut equal = GossipRecord::new(peer("p1"), 1);
        equal.mark(GossipState::Dead);
        svc.handle_envelope(
            envelope("p2", Payload::Sync { records: vec![equal] }),
            source(),
        )
        .await
        .unwrap();
        assert_eq!(
            svc.records()
                .into_iter()
                .find(|r| r.node.id == NodeId::new("p1"))
                .unwrap()
                .state,
            GossipState::Alive
        );
    }

    #[tokio::test]
    async fn test_heartbeat_restores_suspect() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();
        assert!(svc.mark_suspect(&NodeId::new("p1")));

        svc.handle_envelope(
            envelope("p1", Payload::Heartbeat { incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();

        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Alive);
        assert!(rec.suspicion.is_none());
    }

    #[tokio::test]
    async fn test_consensus_kinds_are_forwarded() {
        let (svc, mut rx) = service().await;

        svc.handle_envelope(
            envelope(
                "p1",
                Payload::RequestVote {
                    term: 2,
                    candidate: NodeId::new("p1"),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            ),
            source(),
        )
        .await
        .unwrap();

        let (forwarded, _) = rx.try_recv().expect("consensus message forwarded");
        assert_eq!(forwarded.payload.kind(), "request-vote");
    }

    #[tokio::test]
    async fn test_expired_suspicion_escalates_to_dead() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 3 }),
            source(),
        )
        .await
        .unwrap();
        assert!(svc.mark_suspect(&NodeId::new("p1")));

        // Push the suspicion deadline into the past, then sweep.
        svc.backdate(&NodeId::new("p1"), 10);
        svc.sweep_suspicions().await;

        let rec = svc
            .records()
            .into_iter()
            .find(|r| r.node.id == NodeId::new("p1"))
            .unwrap();
        assert_eq!(rec.state, GossipState::Dead);
        assert!(rec.suspicion.is_none());
        assert_eq!(svc.stats().deaths_declared, 1);
    }

    #[tokio::test]
    async fn test_left_nodes_are_reaped_after_grace() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 1 }),
            source(),
        )
        .await
        .unwrap();
        svc.handle_envelope(envelope("p1", Payload::Leave), source())
            .await
            .unwrap();
        assert!(svc.get(&NodeId::new("p1")).is_some());

        svc.backdate(&NodeId::new("p1"), 31);
        svc.sweep_suspicions().await;
        assert!(svc.get(&NodeId::new("p1")).is_none());
    }

    #[tokio::test]
    async fn test_quorum_uses_alive_count() {
        let (svc, _rx) = service().await;

        svc.handle_envelope(
            envelope("p1", Payload::Alive { node: peer("p1"), incarnation: 1 }),
            source(),
        )
        .await
        .unwrap();
        svc.handle_envelope(
            envelope("p2", Payload::Alive { node: peer("p2"), incarnation: 1 }),
            source(),
        )
        .await
        .unwrap();
        assert_eq!(svc.alive_count(), 3);
        assert_eq!(svc.quorum(), 2);

        // One peer dead: quorum is over the two alive, not the three total.
        assert!(svc.mark_dead(&NodeId::new("p2")));
        assert_eq!(svc.alive_count(), 2);
        assert_eq!(svc.quorum(), 2);
        assert!(svc.mark_dead(&NodeId::new("p1")));
        assert_eq!(svc.quorum(), 1);
    }
}
