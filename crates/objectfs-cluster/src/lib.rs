//! ObjectFS Cluster Coordination
//!
//! This crate keeps a multi-node ObjectFS deployment coordinated: a gossip
//! membership layer with failure detection, a raft-style consensus engine for
//! leader election and an in-memory replicated command log, and an operation
//! coordinator that dispatches client operations under a selectable
//! consistency discipline.
//!
//! # Features
//!
//! - **Membership**: SWIM-style gossip over a single UDP socket with
//!   incarnation-ordered liveness claims, suspicion timers and anti-entropy
//!   sync
//! - **Consensus**: leader election with randomized timeouts, append-entries
//!   log replication and alive-majority quorums
//! - **Proposals**: cluster-wide decisions (leadership changes, config
//!   changes) voted on by the alive majority
//! - **Operation dispatch**: strong / session / eventual consistency with
//!   asynchronous write replication
//! - **Load balancing**: round-robin, least-load, consistent-hash and
//!   latency-based target selection
//!
//! # Example
//!
//! ```no_run
//! use objectfs_cluster::{ClusterConfig, ClusterManager};
//! use objectfs_cluster::coordinator::{DistributedOperation, OperationKind};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClusterConfig::default();
//! config.listen_addr = "0.0.0.0:8080".parse()?;
//! config.seed_nodes = vec!["10.0.0.5:8080".parse()?];
//!
//! let manager = ClusterManager::new(config).await?;
//! manager.start().await?;
//!
//! let put = DistributedOperation::new(OperationKind::Put, "photos/cat.jpg")
//!     .with_payload(b"...".to_vec());
//! let result = manager.distribute_operation(put).await;
//! assert!(result.success);
//!
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod membership;
pub mod node;
pub mod stats;
pub mod tasks;

// Re-export primary types
pub use config::{
    ClusterConfig, ConsensusConfig, Consistency, GossipConfig, LoadBalancingStrategy,
    OperationConfig, ReplicationConfig,
};
pub use consensus::{ConsensusService, EntryKind, LogEntry, ProposalKind, ProposalStatus, Role};
pub use coordinator::{
    DistributedOperation, LoopbackExecutor, NodeResult, OperationCoordinator, OperationExecutor,
    OperationKind, OperationResult,
};
pub use error::{ClusterError, Result};
pub use manager::ClusterManager;
pub use membership::{GossipRecord, GossipState, MembershipService};
pub use node::{NodeDescriptor, NodeId, NodeResources, NodeStatus};
pub use stats::ClusterStats;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = membership::PROTOCOL_VERSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
