//! Node identity, status and descriptors.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Stable node identifier.
///
/// Generated from 64 random bits hex-encoded when not configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create an identifier from a configured string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier from the OS random source.
    pub fn generate() -> Self {
        Self(format!("{:016x}", OsRng.next_u64()))
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node status in the cluster table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is reachable and participating
    Alive,
    /// Node missed heartbeats and may be failed
    Suspect,
    /// Node is considered failed
    Dead,
    /// Node is joining the cluster
    Joining,
    /// Node is leaving gracefully
    Leaving,
}

impl NodeStatus {
    /// Check if the node can be a target for operations.
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeStatus::Alive)
    }

    /// Check if the node is gone or on its way out.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, NodeStatus::Dead | NodeStatus::Leaving)
    }
}

/// Soft resource and utilization fields, updated by peer reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResources {
    /// CPU utilization (0.0 - 1.0)
    pub cpu: f64,

    /// Memory utilization (0.0 - 1.0)
    pub memory: f64,

    /// Disk utilization (0.0 - 1.0)
    pub disk: f64,

    /// Cumulative bandwidth counter in bytes
    pub bandwidth_bytes: u64,

    /// Cache size in bytes
    pub cache_size: u64,

    /// Cache hit rate (0.0 - 1.0)
    pub cache_hit_rate: f64,

    /// Operations handled locally
    pub local_operations: u64,
}

/// Complete node descriptor.
///
/// Identity is immutable; status and resource fields are mutated through
/// the membership table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Stable node identifier
    pub id: NodeId,

    /// Advertised transport address
    pub addr: SocketAddr,

    /// Node status (authoritative in the membership table)
    pub status: NodeStatus,

    /// Last seen timestamp
    pub last_seen: DateTime<Utc>,

    /// Software version string
    pub version: String,

    /// Free-form metadata
    pub metadata: HashMap<String, String>,

    /// Soft resource fields
    pub resources: NodeResources,
}

impl NodeDescriptor {
    /// Create a new descriptor in joining state.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            status: NodeStatus::Joining,
            last_seen: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: HashMap::new(),
            resources: NodeResources::default(),
        }
    }

    /// Set the version string.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Update the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Check whether the node has not been seen within `timeout`.
    pub fn is_stale(&self, timeout: std::time::Duration) -> bool {
        let elapsed = (Utc::now() - self.last_seen)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        elapsed > timeout
    }
}
