//! Operation coordination.
//!
//! Accepts externally submitted operations, selects targets from live
//! membership, executes them under the caller's consistency label and
//! schedules asynchronous replication for writes. Executing an operation
//! *on* a node is the storage layer's job and sits behind the
//! [`OperationExecutor`] seam.

pub mod balancer;
pub mod operation;
pub mod replicator;

pub use balancer::{HashRing, LoadBalancer, NodeLoadMetrics, RingStats};
pub use operation::{
    ActiveOperation, DistributedOperation, NodeResult, OperationKind, OperationResult,
};
pub use replicator::{ReplicationStats, ReplicationTask, Replicator};

use crate::config::{Consistency, OperationConfig, ReplicationConfig};
use crate::consensus::ConsensusService;
use crate::error::{ClusterError, Result};
use crate::membership::MembershipService;
use crate::node::{NodeDescriptor, NodeId};
use crate::stats::ClusterStats;
use crate::tasks::{CancelToken, Shutdown};
use async_trait::async_trait;
use chrono::Utc;
use futures::future;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes one operation against one node.
///
/// The filesystem/object-store layers plug in here; the coordinator only
/// cares about success, payload and latency.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Run `operation` on `node`, returning the response payload.
    async fn execute(
        &self,
        node: &NodeDescriptor,
        operation: &DistributedOperation,
    ) -> Result<Option<Vec<u8>>>;
}

/// In-memory executor serving the local node.
pub struct LoopbackExecutor {
    local_id: NodeId,
    store: RwLock<HashMap<String, Vec<u8>>>,
}

impl LoopbackExecutor {
    /// Create an empty local store.
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            store: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl OperationExecutor for LoopbackExecutor {
    async fn execute(
        &self,
        node: &NodeDescriptor,
        operation: &DistributedOperation,
    ) -> Result<Option<Vec<u8>>> {
        if node.id != self.local_id {
            return Err(ClusterError::Network(format!(
                "no transport to remote node {}",
                node.id
            )));
        }

        match operation.kind {
            OperationKind::Put => {
                let payload = operation.payload.clone().unwrap_or_default();
                self.store.write().insert(operation.key.clone(), payload);
                Ok(None)
            }
            OperationKind::Get => Ok(self.store.read().get(&operation.key).cloned()),
            OperationKind::Delete => {
                self.store.write().remove(&operation.key);
                Ok(None)
            }
            OperationKind::List => {
                let mut keys: Vec<String> = self
                    .store
                    .read()
                    .keys()
                    .filter(|k| k.starts_with(&operation.key))
                    .cloned()
                    .collect();
                keys.sort();
                Ok(Some(serde_json::to_vec(&keys)?))
            }
            OperationKind::Batch => Ok(None),
        }
    }
}

/// Coordinates distributed operations across the cluster.
pub struct OperationCoordinator {
    local_id: NodeId,

    membership: Arc<MembershipService>,

    consensus: Arc<ConsensusService>,

    balancer: Arc<LoadBalancer>,

    replicator: Arc<Replicator>,

    executor: Arc<dyn OperationExecutor>,

    replication: ReplicationConfig,

    config: OperationConfig,

    /// In-flight operations, reaped at their deadline
    active: RwLock<HashMap<String, ActiveOperation>>,

    /// Concurrency ceiling
    semaphore: Arc<tokio::sync::Semaphore>,

    /// Sequence for synthesized operation ids
    op_seq: AtomicU64,

    counters: Arc<RwLock<ClusterStats>>,

    shutdown: Shutdown,
}

impl OperationCoordinator {
    /// Wire the coordinator to its collaborators.
    pub fn new(
        membership: Arc<MembershipService>,
        consensus: Arc<ConsensusService>,
        executor: Arc<dyn OperationExecutor>,
        replication: ReplicationConfig,
        config: OperationConfig,
        counters: Arc<RwLock<ClusterStats>>,
        shutdown: Shutdown,
    ) -> Self {
        let replicator = Arc::new(Replicator::new(
            Arc::clone(&executor),
            Arc::clone(&counters),
            shutdown.clone(),
        ));
        Self {
            local_id: membership.local_id().clone(),
            membership,
            consensus,
            balancer: Arc::new(LoadBalancer::new(config.load_balancing)),
            replicator,
            executor,
            replication,
            semaphore: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_ops)),
            config,
            active: RwLock::new(HashMap::new()),
            op_seq: AtomicU64::new(0),
            counters,
            shutdown,
        }
    }

    /// Background replication queue.
    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Target selection metrics.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Number of operations currently in flight.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Execute an operation to a terminal result.
    ///
    /// The caller always receives an [`OperationResult`]; failures carry an
    /// error string plus whatever per-node results were collected.
    pub async fn execute(&self, operation: DistributedOperation) -> OperationResult {
        let started = Instant::now();
        let mut operation = operation;
        if operation.id.is_empty() {
            operation.id = self.synthesize_id();
        }
        let op_id = operation.id.clone();

        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let result = OperationResult::failed(
                    op_id,
                    format!(
                        "concurrency ceiling of {} reached",
                        self.config.max_concurrent_ops
                    ),
                    Vec::new(),
                    started.elapsed(),
                );
                self.record_result(&result, started);
                return result;
            }
        };

        let tracked = ActiveOperation::new(operation.clone());
        let cancel = tracked.cancel.clone();
        self.active.write().insert(op_id.clone(), tracked);

        let outcome = tokio::time::timeout(
            operation.timeout,
            self.run(operation.clone(), cancel.clone()),
        )
        .await;

        self.active.write().remove(&op_id);
        drop(permit);

        let duration = started.elapsed();
        let mut result = match outcome {
            Ok(result) => result,
            Err(_) => OperationResult::failed(
                op_id,
                format!("operation timed out after {:?}", operation.timeout),
                Vec::new(),
                duration,
            ),
        };
        result.duration = duration;

        self.record_result(&result, started);
        result
    }

    fn record_result(&self, result: &OperationResult, started: Instant) {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.counters
            .write()
            .record_operation(result.success, latency_ms);
    }

    async fn run(&self, operation: DistributedOperation, cancel: CancelToken) -> OperationResult {
        let op_id = operation.id.clone();

        let targets = match self.select_targets(&operation) {
            Ok(targets) if targets.is_empty() => {
                return OperationResult::failed(
                    op_id,
                    ClusterError::NoAliveNodes.to_string(),
                    Vec::new(),
                    Duration::ZERO,
                )
            }
            Ok(targets) => targets,
            Err(e) => {
                return OperationResult::failed(op_id, e.to_string(), Vec::new(), Duration::ZERO)
            }
        };

        if cancel.is_canceled() {
            return OperationResult::failed(op_id, "canceled", Vec::new(), Duration::ZERO);
        }

        match operation.consistency {
            Consistency::Strong => self.run_strong(operation, targets, cancel).await,
            Consistency::Session | Consistency::Eventual => {
                self.run_primary(operation, targets, cancel).await
            }
        }
    }

    /// Pick the target set for an operation.
    fn select_targets(&self, operation: &DistributedOperation) -> Result<Vec<NodeDescriptor>> {
        if let Some(explicit) = &operation.target_nodes {
            let mut targets = Vec::with_capacity(explicit.len());
            for id in explicit {
                let descriptor = self
                    .membership
                    .get(id)
                    .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))?;
                targets.push(descriptor);
            }
            return Ok(targets);
        }

        let alive = self.membership.alive_nodes();
        if alive.is_empty() {
            return Err(ClusterError::NoAliveNodes);
        }

        let count = match operation.kind {
            OperationKind::Get | OperationKind::List => 1,
            OperationKind::Put | OperationKind::Delete => {
                self.replication.replication_factor.min(alive.len())
            }
            OperationKind::Batch => 3.min(alive.len()),
        };

        // Listings prefer the leader's view when one is alive.
        if operation.kind == OperationKind::List {
            if let Some(leader) = self.consensus.leader() {
                if let Some(descriptor) = alive.iter().find(|n| n.id == leader) {
                    return Ok(vec![descriptor.clone()]);
                }
            }
        }

        let candidate_ids: Vec<NodeId> = alive.iter().map(|n| n.id.clone()).collect();
        let chosen = self.balancer.select(&candidate_ids, &operation.key, count);
        if chosen.is_empty() {
            return Err(ClusterError::NoAliveNodes);
        }

        Ok(chosen
            .into_iter()
            .filter_map(|id| alive.iter().find(|n| n.id == id).cloned())
            .collect())
    }

    /// Strong consistency: all targets in parallel, majority must accept.
    async fn run_strong(
        &self,
        operation: DistributedOperation,
        targets: Vec<NodeDescriptor>,
        cancel: CancelToken,
    ) -> OperationResult {
        let op_id = operation.id.clone();
        let n = targets.len();
        let required = n / 2 + 1;

        let attempts = targets
            .iter()
            .map(|target| self.attempt(target, &operation, &cancel));
        let node_results: Vec<NodeResult> = future::join_all(attempts).await;

        let succeeded = node_results.iter().filter(|r| r.success).count();
        if succeeded >= required {
            let payload = node_results
                .iter()
                .find(|r| r.success)
                .and_then(|r| r.payload.clone());
            OperationResult::ok(op_id, payload, node_results, Duration::ZERO)
        } else {
            self.counters.write().record_consistency_violation();
            let first_error = node_results
                .iter()
                .filter_map(|r| r.error.as_deref())
                .next()
                .unwrap_or("no per-node error recorded");
            let error = format!(
                "strong consistency shortfall: {}/{} required replicas succeeded ({})",
                succeeded, required, first_error
            );
            OperationResult::failed(op_id, error, node_results, Duration::ZERO)
        }
    }

    /// Session/eventual: primary decides, the remainder replicates async.
    async fn run_primary(
        &self,
        operation: DistributedOperation,
        targets: Vec<NodeDescriptor>,
        cancel: CancelToken,
    ) -> OperationResult {
        let op_id = operation.id.clone();
        let primary = targets[0].clone();

        let result = self.attempt(&primary, &operation, &cancel).await;
        let schedule_replicas = operation.kind.is_write()
            && self.replication.cache_replication
            && targets.len() > 1
            && match operation.consistency {
                // Session replicates its writes regardless of the primary
                // outcome; eventual only propagates applied writes.
                Consistency::Session => true,
                Consistency::Eventual => result.success,
                Consistency::Strong => false,
            };

        if schedule_replicas {
            self.replicator.enqueue(ReplicationTask::new(
                operation.clone(),
                targets[1..].to_vec(),
            ));
        }

        if result.success {
            let payload = result.payload.clone();
            OperationResult::ok(op_id, payload, vec![result], Duration::ZERO)
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "primary failed".to_string());
            OperationResult::failed(op_id, error, vec![result], Duration::ZERO)
        }
    }

    /// One attempt against one node.
    async fn attempt(
        &self,
        target: &NodeDescriptor,
        operation: &DistributedOperation,
        cancel: &CancelToken,
    ) -> NodeResult {
        if cancel.is_canceled() {
            return NodeResult::err(target.id.clone(), "canceled", Duration::ZERO);
        }

        self.balancer.record_routed(&target.id);
        let started = Instant::now();

        match self.executor.execute(target, operation).await {
            Ok(payload) => {
                let latency = started.elapsed();
                self.balancer
                    .record_latency(&target.id, latency.as_secs_f64() * 1000.0);
                NodeResult::ok(target.id.clone(), payload, latency)
            }
            Err(e) => {
                let latency = started.elapsed();
                debug!(node = %target.id, error = %e, "node attempt failed");
                NodeResult::err(target.id.clone(), e.to_string(), latency)
            }
        }
    }

    fn synthesize_id(&self) -> String {
        format!(
            "op-{}-{}-{}",
            Utc::now().timestamp_micros(),
            self.op_seq.fetch_add(1, Ordering::SeqCst),
            self.local_id
        )
    }

    /// Cancel and drop active operations past their deadline.
    fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .active
            .read()
            .iter()
            .filter(|(_, op)| op.is_past_deadline(now))
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let mut active = self.active.write();
        for id in expired {
            if let Some(op) = active.remove(&id) {
                warn!(operation = %id, "operation past deadline, canceling");
                op.cancel.cancel();
            }
        }
    }

    /// Deadline sweeper, every 30 s.
    pub async fn cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_expired(),
                _ = shutdown.wait() => break,
            }
        }
    }

    /// Load-balancer metrics snapshot, every 10 s.
    pub async fn balancer_stats_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = self.balancer.all_metrics();
                    let routed: u64 = metrics.iter().map(|m| m.routed_requests).sum();
                    debug!(
                        nodes = metrics.len(),
                        routed,
                        strategy = ?self.balancer.strategy(),
                        "load balancer stats"
                    );
                }
                _ = shutdown.wait() => break,
            }
        }
    }
}
