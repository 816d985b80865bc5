//! Cluster configuration settings.

use crate::error::ClusterError;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Comprehensive cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stable identifier of this node (generated when absent)
    pub node_id: Option<NodeId>,

    /// UDP bind address for gossip
    pub listen_addr: SocketAddr,

    /// Address peers use to reach this node
    pub advertise_addr: SocketAddr,

    /// Addresses to contact on startup for join
    pub seed_nodes: Vec<SocketAddr>,

    /// Per-seed join attempt timeout
    pub join_timeout: Duration,

    /// Gossip configuration
    pub gossip: GossipConfig,

    /// Consensus configuration
    pub consensus: ConsensusConfig,

    /// Replication configuration
    pub replication: ReplicationConfig,

    /// Operation dispatch configuration
    pub operations: OperationConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            advertise_addr: "127.0.0.1:8080".parse().unwrap(),
            seed_nodes: Vec::new(),
            join_timeout: Duration::from_secs(30),
            gossip: GossipConfig::default(),
            consensus: ConsensusConfig::default(),
            replication: ReplicationConfig::default(),
            operations: OperationConfig::default(),
        }
    }
}

/// Gossip protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Cadence of the gossip outbound loop
    pub gossip_interval: Duration,

    /// Peers contacted per gossip round
    pub gossip_fanout: usize,

    /// Maximum size of one datagram
    pub max_packet: usize,

    /// Suspicion deadline before escalating to dead
    pub suspicion_timeout: Duration,

    /// Grace period before a left node is removed
    pub leave_grace: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(500),
            gossip_fanout: 3,
            max_packet: 1024,
            suspicion_timeout: Duration::from_secs(5),
            leave_grace: Duration::from_secs(30),
        }
    }
}

/// Consensus protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Base election timeout; the effective timeout adds a random
    /// jitter in [0, base). When unset, 150 ms + rand(0, 150 ms) applies.
    pub election_timeout: Option<Duration>,

    /// Leader heartbeat cadence; also the base failure-detector tick
    pub heartbeat_interval: Duration,

    /// Advisory TTL for leader claims
    pub leadership_ttl: Duration,

    /// Proposal time-to-live before expiry
    pub proposal_ttl: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout: Some(Duration::from_secs(5)),
            heartbeat_interval: Duration::from_secs(1),
            leadership_ttl: Duration::from_secs(10),
            proposal_ttl: Duration::from_secs(30),
        }
    }
}

/// Data replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Whether writes schedule async replication
    pub cache_replication: bool,

    /// Target peer count for writes
    pub replication_factor: usize,

    /// Default consistency label
    pub consistency_level: Consistency,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            cache_replication: true,
            replication_factor: 3,
            consistency_level: Consistency::Eventual,
        }
    }
}

/// Operation dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Coordinator concurrency ceiling
    pub max_concurrent_ops: usize,

    /// Default per-operation deadline
    pub operation_timeout: Duration,

    /// Default caller retry budget
    pub retry_attempts: u32,

    /// Default base retry delay
    pub retry_backoff: Duration,

    /// Target selection strategy
    pub load_balancing: LoadBalancingStrategy,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: 100,
            operation_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            load_balancing: LoadBalancingStrategy::RoundRobin,
        }
    }
}

/// Consistency label for read/write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Primary success, async replication afterwards
    Eventual,
    /// Primary success, replication on the write path
    Session,
    /// Majority of the target set must acknowledge
    Strong,
}

impl Consistency {
    /// Calculate required node acknowledgments for a target set of `n`.
    pub fn required_nodes(&self, n: usize) -> usize {
        match self {
            Consistency::Eventual | Consistency::Session => 1,
            Consistency::Strong => n / 2 + 1,
        }
    }
}

impl FromStr for Consistency {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eventual" => Ok(Consistency::Eventual),
            "session" => Ok(Consistency::Session),
            "strong" => Ok(Consistency::Strong),
            other => Err(ClusterError::UnknownConsistency(other.to_string())),
        }
    }
}

/// Target selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancingStrategy {
    /// Rotate through candidates
    RoundRobin,
    /// Fewest routed requests first
    LeastLoad,
    /// Hash-ring placement keyed by operation key
    ConsistentHash,
    /// Lowest smoothed response time first
    LatencyBased,
}
