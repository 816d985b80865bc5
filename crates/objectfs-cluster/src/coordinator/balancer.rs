//! Target selection strategies.

use crate::config::LoadBalancingStrategy;
use crate::node::NodeId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Virtual nodes per physical node on the hash ring.
const VIRTUAL_NODES: usize = 150;

/// Smoothing factor for per-node response times.
const LATENCY_ALPHA: f64 = 0.3;

/// Per-node routing metrics.
#[derive(Debug, Clone)]
pub struct NodeLoadMetrics {
    /// Node these metrics describe
    pub node_id: NodeId,

    /// Requests routed to the node
    pub routed_requests: u64,

    /// Smoothed response time in milliseconds
    pub avg_latency_ms: f64,
}

impl NodeLoadMetrics {
    /// Fresh metrics for a node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            routed_requests: 0,
            avg_latency_ms: 0.0,
        }
    }
}

/// Selects operation targets among the alive candidates.
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,

    metrics: RwLock<HashMap<NodeId, NodeLoadMetrics>>,

    round_robin: RwLock<usize>,

    ring: RwLock<HashRing>,
}

impl LoadBalancer {
    /// Create a balancer with the given strategy.
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            metrics: RwLock::new(HashMap::new()),
            round_robin: RwLock::new(0),
            ring: RwLock::new(HashRing::new(VIRTUAL_NODES)),
        }
    }

    /// Active strategy.
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Pick up to `count` distinct targets from `candidates` for `key`.
    pub fn select(&self, candidates: &[NodeId], key: &str, count: usize) -> Vec<NodeId> {
        if candidates.is_empty() || count == 0 {
            return Vec::new();
        }
        let count = count.min(candidates.len());

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(candidates, count),
            LoadBalancingStrategy::LeastLoad => self.select_least_load(candidates, count),
            LoadBalancingStrategy::ConsistentHash => self.select_hashed(candidates, key, count),
            LoadBalancingStrategy::LatencyBased => self.select_by_latency(candidates, count),
        }
    }

    fn select_round_robin(&self, candidates: &[NodeId], count: usize) -> Vec<NodeId> {
        let mut sorted: Vec<NodeId> = candidates.to_vec();
        sorted.sort();

        let mut index = self.round_robin.write();
        let start = *index % sorted.len();
        *index = (*index + 1) % sorted.len();

        (0..count)
            .map(|i| sorted[(start + i) % sorted.len()].clone())
            .collect()
    }

    fn select_least_load(&self, candidates: &[NodeId], count: usize) -> Vec<NodeId> {
        let metrics = self.metrics.read();
        let mut sorted: Vec<NodeId> = candidates.to_vec();
        sorted.sort_by_key(|id| {
            metrics
                .get(id)
                .map(|m| m.routed_requests)
                .unwrap_or(0)
        });
        sorted.truncate(count);
        sorted
    }

    fn select_hashed(&self, candidates: &[NodeId], key: &str, count: usize) -> Vec<NodeId> {
        let mut ring = self.ring.write();
        ring.sync(candidates);
        ring.nodes_for(key, count)
    }

    fn select_by_latency(&self, candidates: &[NodeId], count: usize) -> Vec<NodeId> {
        let metrics = self.metrics.read();
        let mut sorted: Vec<NodeId> = candidates.to_vec();
        sorted.sort_by(|a, b| {
            let la = metrics.get(a).map(|m| m.avg_latency_ms).unwrap_or(0.0);
            let lb = metrics.get(b).map(|m| m.avg_latency_ms).unwrap_or(0.0);
            la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(count);
        sorted
    }

    /// Count a request routed to `node`.
    pub fn record_routed(&self, node: &NodeId) {
        let mut metrics = self.metrics.write();
        metrics
            .entry(node.clone())
            .or_insert_with(|| NodeLoadMetrics::new(node.clone()))
            .routed_requests += 1;
    }

    /// Blend an observed response time into the node's average.
    pub fn record_latency(&self, node: &NodeId, latency_ms: f64) {
        let mut metrics = self.metrics.write();
        let entry = metrics
            .entry(node.clone())
            .or_insert_with(|| NodeLoadMetrics::new(node.clone()));
        if entry.avg_latency_ms == 0.0 {
            entry.avg_latency_ms = latency_ms;
        } else {
            entry.avg_latency_ms =
                LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * entry.avg_latency_ms;
        }
    }

    /// Forget a departed node.
    pub fn remove_node(&self, node: &NodeId) {
        self.metrics.write().remove(node);
        self.ring.write().remove_node(node);
    }

    /// Metrics snapshot for all known nodes.
    pub fn all_metrics(&self) -> Vec<NodeLoadMetrics> {
        self.metrics.read().values().cloned().collect()
    }

    /// Hash-ring distribution snapshot.
    pub fn ring_stats(&self) -> RingStats {
        self.ring.read().stats()
    }
}

/// Consistent hash ring with virtual nodes.
#[derive(Debug)]
pub struct HashRing {
    ring: BTreeMap<u64, NodeId>,
    virtual_nodes: usize,
    nodes: HashSet<NodeId>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            virtual_nodes,
            nodes: HashSet::new(),
        }
    }

    /// Add a node and its virtual points.
    pub fn add_node(&mut self, node: NodeId) {
        if !self.nodes.insert(node.clone()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let hash = hash_key(&format!("{}:{}", node, i));
            self.ring.insert(hash, node.clone());
        }
    }

    /// Remove a node and its virtual points.
    pub fn remove_node(&mut self, node: &NodeId) {
        if !self.nodes.remove(node) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let hash = hash_key(&format!("{}:{}", node, i));
            self.ring.remove(&hash);
        }
    }

    /// Reconcile ring membership with `candidates`.
    pub fn sync(&mut self, candidates: &[NodeId]) {
        let wanted: HashSet<NodeId> = candidates.iter().cloned().collect();
        let stale: Vec<NodeId> = self.nodes.difference(&wanted).cloned().collect();
        for node in stale {
            self.remove_node(&node);
        }
        for node in candidates {
            self.add_node(node.clone());
        }
    }

    /// First `count` distinct nodes walking clockwise from the key's hash.
    pub fn nodes_for(&self, key: &str, count: usize) -> Vec<NodeId> {
        if self.ring.is_empty() {
            return Vec::new();
        }

        let hash = hash_key(key);
        let mut result = Vec::new();
        let mut seen = HashSet::new();

        for (_, node) in self.ring.range(hash..).chain(self.ring.iter()) {
            if seen.insert(node.clone()) {
                result.push(node.clone());
                if result.len() >= count {
                    break;
                }
            }
        }
        result
    }

    /// Distribution statistics.
    pub fn stats(&self) -> RingStats {
        let mut distribution: HashMap<NodeId, usize> = HashMap::new();
        for node in self.ring.values() {
            *distribution.entry(node.clone()).or_insert(0) += 1;
        }
        RingStats {
            physical_nodes: self.nodes.len(),
            total_virtual_nodes: self.ring.len(),
            distribution,
        }
    }
}

/// Hash-ring distribution snapshot.
#[derive(Debug)]
pub struct RingStats {
    pub physical_nodes: usize,
    pub total_virtual_nodes: usize,
    pub distribution: HashMap<NodeId, usize>,
}

fn hash_key(key: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
