//! Cluster manager facade.
//!
//! Owns the node id, the configuration and the three subsystems, and exposes
//! the public surface of the coordination layer. The manager also runs the
//! cluster-level failure detector on top of gossip's own suspicion handling.

use crate::config::ClusterConfig;
use crate::consensus::{ConsensusService, LeadershipChange, ProposalKind};
use crate::coordinator::{
    DistributedOperation, LoopbackExecutor, OperationCoordinator, OperationExecutor,
    OperationResult,
};
use crate::error::{ClusterError, Result};
use crate::membership::{GossipState, GossipTransport, MembershipService};
use crate::node::{NodeDescriptor, NodeId, NodeStatus};
use crate::stats::{ClusterStats, NodeCounts};
use crate::tasks::{spawn_supervised, Shutdown};
use chrono::Utc;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Entry point of the cluster coordination layer.
pub struct ClusterManager {
    config: ClusterConfig,

    local_id: NodeId,

    advertise_addr: SocketAddr,

    membership: Arc<MembershipService>,

    consensus: Arc<ConsensusService>,

    coordinator: Arc<OperationCoordinator>,

    /// Cluster-wide counters behind their own lock
    stats: Arc<RwLock<ClusterStats>>,

    shutdown: Shutdown,

    running: tokio::sync::RwLock<bool>,
}

impl ClusterManager {
    /// Create a manager with the in-memory loopback executor.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        let local_id = config.node_id.clone().unwrap_or_else(NodeId::generate);
        let executor = Arc::new(LoopbackExecutor::new(local_id.clone()));
        Self::with_executor(config, local_id, executor).await
    }

    /// Create a manager with a caller-supplied executor (the seam the
    /// filesystem and object-store layers plug into).
    pub async fn with_executor(
        config: ClusterConfig,
        local_id: NodeId,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<Self> {
        let transport = Arc::new(
            GossipTransport::bind(
                config.listen_addr,
                local_id.clone(),
                config.gossip.max_packet,
            )
            .await?,
        );
        let bound = transport.local_addr()?;
        let advertise_addr = if config.advertise_addr.port() == 0 {
            bound
        } else {
            config.advertise_addr
        };

        let local = NodeDescriptor::new(local_id.clone(), advertise_addr)
            .with_status(NodeStatus::Joining);

        let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(ClusterStats::default()));
        let shutdown = Shutdown::new();

        let membership = Arc::new(MembershipService::new(
            local,
            config.gossip.clone(),
            config.seed_nodes.clone(),
            config.join_timeout,
            transport,
            consensus_tx,
            Arc::clone(&stats),
            shutdown.clone(),
        ));

        let consensus = Arc::new(ConsensusService::new(
            Arc::clone(&membership),
            config.consensus.clone(),
            consensus_rx,
            Arc::clone(&stats),
            shutdown.clone(),
        ));

        let coordinator = Arc::new(OperationCoordinator::new(
            Arc::clone(&membership),
            Arc::clone(&consensus),
            executor,
            config.replication.clone(),
            config.operations.clone(),
            Arc::clone(&stats),
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            local_id,
            advertise_addr,
            membership,
            consensus,
            coordinator,
            stats,
            shutdown,
            running: tokio::sync::RwLock::new(false),
        })
    }

    /// Start every background loop and contact the seed nodes. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running || self.shutdown.is_triggered() {
            return Ok(());
        }
        *running = true;
        drop(running);

        info!(node = %self.local_id, addr = %self.advertise_addr, "starting cluster manager");

        // Membership.
        let m = Arc::clone(&self.membership);
        spawn_supervised("gossip-recv", self.shutdown.signal(), move || {
            Arc::clone(&m).receiver_loop()
        });
        let m = Arc::clone(&self.membership);
        spawn_supervised("gossip-out", self.shutdown.signal(), move || {
            Arc::clone(&m).gossip_loop()
        });
        let m = Arc::clone(&self.membership);
        spawn_supervised("suspicion-timer", self.shutdown.signal(), move || {
            Arc::clone(&m).suspicion_loop()
        });
        let m = Arc::clone(&self.membership);
        spawn_supervised("gossip-stats", self.shutdown.signal(), move || {
            Arc::clone(&m).stats_loop()
        });

        // Consensus.
        let c = Arc::clone(&self.consensus);
        spawn_supervised("consensus-inbox", self.shutdown.signal(), move || {
            Arc::clone(&c).message_loop()
        });
        let c = Arc::clone(&self.consensus);
        spawn_supervised("election-timer", self.shutdown.signal(), move || {
            Arc::clone(&c).election_loop()
        });
        let c = Arc::clone(&self.consensus);
        spawn_supervised("leader-heartbeat", self.shutdown.signal(), move || {
            Arc::clone(&c).heartbeat_loop()
        });
        let c = Arc::clone(&self.consensus);
        spawn_supervised("proposal-cleanup", self.shutdown.signal(), move || {
            Arc::clone(&c).proposal_cleanup_loop()
        });
        let c = Arc::clone(&self.consensus);
        spawn_supervised("consensus-stats", self.shutdown.signal(), move || {
            Arc::clone(&c).stats_loop()
        });

        // Coordinator.
        let replicator = Arc::clone(self.coordinator.replicator());
        spawn_supervised("replication-worker", self.shutdown.signal(), move || {
            Arc::clone(&replicator).worker_loop()
        });
        let co = Arc::clone(&self.coordinator);
        spawn_supervised("op-cleanup", self.shutdown.signal(), move || {
            Arc::clone(&co).cleanup_loop()
        });
        let co = Arc::clone(&self.coordinator);
        spawn_supervised("balancer-stats", self.shutdown.signal(), move || {
            Arc::clone(&co).balancer_stats_loop()
        });

        // Cluster-level loops.
        let mgr = self.health_loop_handle();
        spawn_supervised("health-check", self.shutdown.signal(), move || {
            mgr.clone().health_loop()
        });
        let mgr = self.health_loop_handle();
        spawn_supervised("cluster-stats", self.shutdown.signal(), move || {
            mgr.clone().cluster_stats_loop()
        });

        self.membership.join_seeds().await?;
        info!("cluster manager started");
        Ok(())
    }

    /// Announce departure and stop every background loop. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;
        drop(running);

        info!(node = %self.local_id, "stopping cluster manager");
        self.membership.leave().await;
        self.shutdown.trigger();
        info!("cluster manager stopped");
        Ok(())
    }

    /// Check whether the manager is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Stable identifier of this node.
    pub fn node_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Address peers use to reach this node.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    /// Current leader, if known.
    pub fn leader(&self) -> Option<NodeId> {
        self.consensus.leader()
    }

    /// Check whether this node leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    /// Deep copy of the node table.
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        self.membership.nodes()
    }

    /// Snapshot of the cluster counters.
    pub fn stats(&self) -> ClusterStats {
        self.refresh_node_counts();
        self.stats.read().clone()
    }

    /// Membership service handle.
    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    /// Consensus engine handle.
    pub fn consensus(&self) -> &Arc<ConsensusService> {
        &self.consensus
    }

    /// Operation coordinator handle.
    pub fn coordinator(&self) -> &Arc<OperationCoordinator> {
        &self.coordinator
    }

    /// Build an operation carrying the configured defaults (consistency
    /// label, deadline, retry budget).
    pub fn new_operation(
        &self,
        kind: crate::coordinator::OperationKind,
        key: impl Into<String>,
    ) -> DistributedOperation {
        let mut op = DistributedOperation::new(kind, key);
        op.consistency = self.config.replication.consistency_level;
        op.timeout = self.config.operations.operation_timeout;
        op.retries = self.config.operations.retry_attempts;
        op
    }

    /// Submit an operation and wait for its terminal result.
    pub async fn distribute_operation(&self, operation: DistributedOperation) -> OperationResult {
        self.coordinator.execute(operation).await
    }

    /// Propose handing leadership to `target`. Leader only.
    pub async fn propose_leadership_change(&self, target: NodeId) -> Result<String> {
        if self.membership.get(&target).is_none() {
            return Err(ClusterError::NodeNotFound(target));
        }
        let payload = bincode::serialize(&LeadershipChange { new_leader: target })?;
        self.consensus
            .propose_change(ProposalKind::LeadershipChange, payload)
            .await
    }

    /// Merge a peer-reported descriptor (gossip callback).
    pub fn update_node_info(&self, descriptor: NodeDescriptor) {
        self.membership.update_node(descriptor);
    }

    /// Install a leader decided out-of-band (gossip callback).
    pub fn set_leader(&self, id: NodeId) {
        self.consensus.set_leader(id);
    }

    /// Drop a node from the table and the balancer.
    pub fn remove_node(&self, id: &NodeId) -> bool {
        self.coordinator.balancer().remove_node(id);
        self.membership.remove_node(id)
    }

    fn health_loop_handle(&self) -> HealthLoop {
        HealthLoop {
            membership: Arc::clone(&self.membership),
            consensus: Arc::clone(&self.consensus),
            stats: Arc::clone(&self.stats),
            heartbeat_interval: self.config.consensus.heartbeat_interval,
            shutdown: self.shutdown.clone(),
        }
    }

    fn refresh_node_counts(&self) {
        let nodes = self.membership.nodes();
        let mut counts = NodeCounts {
            total: nodes.len(),
            ..NodeCounts::default()
        };
        let mut hit_rates = Vec::new();
        for node in &nodes {
            match node.status {
                NodeStatus::Alive => counts.alive += 1,
                NodeStatus::Suspect => counts.suspect += 1,
                NodeStatus::Dead => counts.dead += 1,
                NodeStatus::Joining => counts.joining += 1,
                NodeStatus::Leaving => counts.leaving += 1,
            }
            if node.status.is_alive() && node.resources.cache_hit_rate > 0.0 {
                hit_rates.push(node.resources.cache_hit_rate);
            }
        }

        let mut stats = self.stats.write();
        stats.nodes = counts;
        if !hit_rates.is_empty() {
            stats.cache_hit_rate = hit_rates.iter().sum::<f64>() / hit_rates.len() as f64;
        }
    }
}

/// Cluster-level failure detector and stats refresher.
///
/// Runs independently of gossip's own suspicion timers: a node unseen for
/// 3x the heartbeat interval becomes suspect, unseen for 6x becomes dead,
/// and a dead leader triggers a fresh election.
#[derive(Clone)]
struct HealthLoop {
    membership: Arc<MembershipService>,
    consensus: Arc<ConsensusService>,
    stats: Arc<RwLock<ClusterStats>>,
    heartbeat_interval: Duration,
    shutdown: Shutdown,
}

impl HealthLoop {
    async fn health_loop(self) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.wait() => break,
            }
        }
    }

    async fn sweep(&self) {
        let suspect_after = self.heartbeat_interval * 3;
        let dead_after = self.heartbeat_interval * 6;
        let local_id = self.membership.local_id().clone();
        let now = Utc::now();

        let mut newly_dead = Vec::new();
        for rec in self.membership.records() {
            if rec.node.id == local_id {
                continue;
            }
            let unseen = (now - rec.node.last_seen).to_std().unwrap_or_default();
            match rec.state {
                GossipState::Alive if unseen > suspect_after => {
                    if self.membership.mark_suspect(&rec.node.id) {
                        warn!(node = %rec.node.id, "node missed heartbeats, marking suspect");
                    }
                }
                GossipState::Suspect if unseen > dead_after => {
                    if self.membership.mark_dead(&rec.node.id) {
                        newly_dead.push(rec.node.id.clone());
                    }
                }
                _ => {}
            }
        }

        for id in newly_dead {
            warn!(node = %id, "node declared dead by failure detector");
            if self.consensus.leader() == Some(id) {
                warn!("dead node was the leader, triggering election");
                self.consensus.clear_leader();
                self.consensus.start_election().await;
            }
        }
    }

    async fn cluster_stats_loop(self) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let alive = self.membership.alive_count();
                    let stats = self.stats.read();
                    tracing::debug!(
                        alive,
                        operations = stats.operations_attempted,
                        elections = stats.elections_started,
                        "cluster stats"
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
    use crate::config::Consistency;
    use crate::coordinator::OperationKind;
    use std::time::Duration;

    fn test_config(seeds: Vec<SocketAddr>) -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.advertise_addr = "127.0.0.1:0".parse().unwrap();
        config.seed_nodes = seeds;
        config.join_timeout = Duration::from_secs(2);
        config.gossip.gossip_interval = Duration::from_millis(100);
        config.gossip.max_packet = 4096;
        config.consensus.election_timeout = Some(Duration::from_millis(200));
        config.consensus.heartbeat_interval = Duration::from_millis(100);
        config
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for: {}", what);
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let manager = ClusterManager::new(test_config(Vec::new())).await.unwrap();

        assert!(!manager.is_running().await);
        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.is_running().await);

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_generated_node_id() {
        let manager = ClusterManager::new(test_config(Vec::new())).await.unwrap();
        assert_eq!(manager.node_id().as_str().len(), 16);
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_serves_operations() {
        let manager = ClusterManager::new(test_config(Vec::new())).await.unwrap();
        manager.start().await.unwrap();

        wait_until("single node to elect itself", Duration::from_secs(3), || {
            manager.is_leader()
        })
        .await;
        assert_eq!(manager.leader(), Some(manager.node_id().clone()));

        let put = DistributedOperation::new(OperationKind::Put, "k").with_payload(vec![42]);
        let result = manager.distribute_operation(put).await;
        assert!(result.success, "put failed: {:?}", result.error);

        let get = DistributedOperation::new(OperationKind::Get, "k");
        let result = manager.distribute_operation(get).await;
        assert!(result.success);
        assert_eq!(result.payload, Some(vec![42]));

        let stats = manager.stats();
        assert_eq!(stats.operations_attempted, 2);
        assert_eq!(stats.operations_succeeded, 2);
        assert!(stats.elections_started >= 1);
        assert_eq!(stats.nodes.alive, 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_operation_carries_configured_defaults() {
        let mut config = test_config(Vec::new());
        config.replication.consistency_level = Consistency::Strong;
        config.operations.operation_timeout = Duration::from_secs(7);
        config.operations.retry_attempts = 5;
        let manager = ClusterManager::new(config).await.unwrap();

        let op = manager.new_operation(OperationKind::Put, "k");
        assert_eq!(op.consistency, Consistency::Strong);
        assert_eq!(op.timeout, Duration::from_secs(7));
        assert_eq!(op.retries, 5);
    }

    #[tokio::test]
    async fn test_propose_leadership_change_requires_leader() {
        let manager = ClusterManager::new(test_config(Vec::new())).await.unwrap();

        let err = manager
            .propose_leadership_change(manager.node_id().clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader(_)));

        let err = manager
            .propose_leadership_change(NodeId::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_health_sweep_escalates_unseen_nodes() {
        let manager = ClusterManager::new(test_config(Vec::new())).await.unwrap();
        let health = manager.health_loop_handle();

        let peer = NodeDescriptor::new(NodeId::new("peer"), "127.0.0.1:9301".parse().unwrap())
            .with_status(NodeStatus::Alive);
        manager.update_node_info(peer);
        manager.set_leader(NodeId::new("peer"));

        // Unseen for > 3 heartbeats: suspect.
        manager.membership().backdate(&NodeId::new("peer"), 1);
        health.sweep().await;
        let node = manager.membership().get(&NodeId::new("peer")).unwrap();
        assert_eq!(node.status, NodeStatus::Suspect);

        // Unseen for > 6 heartbeats: dead, leadership cleared, re-election.
        manager.membership().backdate(&NodeId::new("peer"), 1);
        health.sweep().await;
        let node = manager.membership().get(&NodeId::new("peer")).unwrap();
        assert_eq!(node.status, NodeStatus::Dead);
        // The only alive node left elects itself on the triggered round.
        assert_eq!(manager.leader(), Some(manager.node_id().clone()));
    }

    #[tokio::test]
    async fn test_three_node_cluster_converges_and_elects() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let a = ClusterManager::new(test_config(Vec::new())).await.unwrap();
        a.start().await.unwrap();
        let seed = a.advertise_addr();

        let b = ClusterManager::new(test_config(vec![seed])).await.unwrap();
        let c = ClusterManager::new(test_config(vec![seed])).await.unwrap();
        b.start().await.unwrap();
        c.start().await.unwrap();

        // Convergence: every table holds all three nodes as alive.
        wait_until("three nodes to converge", Duration::from_secs(5), || {
            [&a, &b, &c]
                .iter()
                .all(|m| m.membership().alive_count() == 3)
        })
        .await;

        // One leader emerges and all nodes agree on it.
        wait_until("a leader to emerge", Duration::from_secs(10), || {
            let leaders: Vec<_> = [&a, &b, &c].iter().filter_map(|m| m.leader()).collect();
            leaders.len() == 3
                && leaders.iter().all(|l| *l == leaders[0])
                && [&a, &b, &c].iter().filter(|m| m.is_leader()).count() == 1
        })
        .await;

        let term_a = a.consensus().current_term();
        assert!(term_a >= 1);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
        c.stop().await.unwrap();
    }
}
