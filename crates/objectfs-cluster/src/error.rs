//! Cluster-specific error types.

use crate::node::NodeId;
use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Comprehensive cluster error types.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no alive nodes")]
    NoAliveNodes,

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("leader not available")]
    NoLeader,

    #[error("not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("quorum not reached: {succeeded}/{required} succeeded, first error: {first_error}")]
    QuorumNotReached {
        succeeded: usize,
        required: usize,
        first_error: String,
    },

    #[error("unsupported operation kind: {0}")]
    UnsupportedOperation(String),

    #[error("unknown consistency label: {0}")]
    UnknownConsistency(String),

    #[error("packet exceeds maximum size: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid cluster configuration: {0}")]
    InvalidConfiguration(String),

    #[error("proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("operation canceled")]
    Canceled,

    #[error("timeout: {0}")]
    Timeout(String),
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}
