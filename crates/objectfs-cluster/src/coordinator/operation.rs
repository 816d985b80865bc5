//! Distributed operations and their results.

use crate::config::Consistency;
use crate::node::NodeId;
use crate::tasks::CancelToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What the caller wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Read one object
    Get,
    /// Write one object
    Put,
    /// Remove one object
    Delete,
    /// Enumerate keys under a prefix
    List,
    /// Several operations carried together
    Batch,
}

impl OperationKind {
    /// Check whether the kind mutates state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            OperationKind::Put | OperationKind::Delete | OperationKind::Batch
        )
    }
}

/// An externally submitted operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedOperation {
    /// Unique identifier; synthesized on submission when empty
    pub id: String,

    /// Operation kind
    pub kind: OperationKind,

    /// Object key
    pub key: String,

    /// Payload for writes
    pub payload: Option<Vec<u8>>,

    /// Byte range (offset, size) for range operations
    pub range: Option<(u64, u64)>,

    /// Free-form metadata
    pub metadata: HashMap<String, String>,

    /// Consistency label
    pub consistency: Consistency,

    /// Per-operation deadline budget
    pub timeout: Duration,

    /// Caller retry budget
    pub retries: u32,

    /// Explicit target nodes, bypassing selection
    pub target_nodes: Option<Vec<NodeId>>,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl DistributedOperation {
    /// Create an operation with library defaults.
    pub fn new(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            key: key.into(),
            payload: None,
            range: None,
            metadata: HashMap::new(),
            consistency: Consistency::Eventual,
            timeout: Duration::from_secs(30),
            retries: 3,
            target_nodes: None,
            created_at: Utc::now(),
        }
    }

    /// Set an explicit identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set a byte range.
    pub fn with_range(mut self, offset: u64, size: u64) -> Self {
        self.range = Some((offset, size));
        self
    }

    /// Select the consistency regime.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Override the deadline budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pin the operation to explicit targets.
    pub fn with_targets(mut self, targets: Vec<NodeId>) -> Self {
        self.target_nodes = Some(targets);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one operation on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    /// The node the attempt ran against
    pub node_id: NodeId,

    /// Whether the node accepted the operation
    pub success: bool,

    /// Response payload on success
    pub payload: Option<Vec<u8>>,

    /// Error message on failure
    pub error: Option<String>,

    /// Observed latency
    pub latency: Duration,
}

impl NodeResult {
    /// Successful attempt.
    pub fn ok(node_id: NodeId, payload: Option<Vec<u8>>, latency: Duration) -> Self {
        Self {
            node_id,
            success: true,
            payload,
            error: None,
            latency,
        }
    }

    /// Failed attempt.
    pub fn err(node_id: NodeId, error: impl Into<String>, latency: Duration) -> Self {
        Self {
            node_id,
            success: false,
            payload: None,
            error: Some(error.into()),
            latency,
        }
    }
}

/// Terminal result handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    /// The operation this result answers
    pub operation_id: String,

    /// Overall outcome under the requested consistency
    pub success: bool,

    /// Response payload, when any node produced one
    pub payload: Option<Vec<u8>>,

    /// Composite error on failure
    pub error: Option<String>,

    /// Per-node outcomes, preserved even on failure
    pub node_results: Vec<NodeResult>,

    /// End-to-end duration
    pub duration: Duration,
}

impl OperationResult {
    /// Successful terminal result.
    pub fn ok(
        operation_id: String,
        payload: Option<Vec<u8>>,
        node_results: Vec<NodeResult>,
        duration: Duration,
    ) -> Self {
        Self {
            operation_id,
            success: true,
            payload,
            error: None,
            node_results,
            duration,
        }
    }

    /// Failed terminal result.
    pub fn failed(
        operation_id: String,
        error: impl Into<String>,
        node_results: Vec<NodeResult>,
        duration: Duration,
    ) -> Self {
        Self {
            operation_id,
            success: false,
            payload: None,
            error: Some(error.into()),
            node_results,
            duration,
        }
    }
}

/// An operation in flight, tracked until completion or deadline.
#[derive(Debug, Clone)]
pub struct ActiveOperation {
    /// The submitted operation
    pub operation: DistributedOperation,

    /// Absolute deadline (start + timeout)
    pub deadline: DateTime<Utc>,

    /// Token canceling the remaining stages
    pub cancel: CancelToken,
}

impl ActiveOperation {
    /// Track `operation` from now until its deadline.
    pub fn new(operation: DistributedOperation) -> Self {
        let deadline = operation.created_at
            + chrono::Duration::from_std(operation.timeout).unwrap_or(chrono::Duration::zero());
        Self {
            operation,
            deadline,
            cancel: CancelToken::new(),
        }
    }

    /// Check whether the deadline has passed.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let op = DistributedOperation::new(OperationKind::Put, "photos/cat.jpg")
            .with_payload(vec![1, 2, 3])
            .with_consistency(Consistency::Strong)
            .with_timeout(Duration::from_secs(5))
            .with_metadata("tier", "hot");

        assert_eq!(op.key, "photos/cat.jpg");
        assert!(op.kind.is_write());
        assert_eq!(op.consistency, Consistency::Strong);
        assert_eq!(op.timeout, Duration::from_secs(5));
        assert!(op.id.is_empty());
    }

    #[test]
    fn test_kind_classification() {
        assert!(!OperationKind::Get.is_write());
        assert!(!OperationKind::List.is_write());
        assert!(OperationKind::Put.is_write());
        assert!(OperationKind::Delete.is_write());
        assert!(OperationKind::Batch.is_write());
    }

    #[test]
    fn test_active_operation_deadline() {
        let op = DistributedOperation::new(OperationKind::Get, "k")
            .with_timeout(Duration::from_secs(30));
        let active = ActiveOperation::new(op);

        assert!(!active.is_past_deadline(Utc::now()));
        assert!(active.is_past_deadline(Utc::now() + chrono::Duration::seconds(31)));
    }
}
