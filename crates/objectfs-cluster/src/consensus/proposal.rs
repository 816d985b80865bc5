//! Cluster-wide proposals and their lifecycle.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a proposal asks the cluster to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    /// Hand leadership to another node
    LeadershipChange,
    /// Change cluster configuration
    ConfigChange,
    /// Execute an arbitrary operation payload
    Operation,
}

/// Proposal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Votes are still being collected
    Pending,
    /// Alive majority accepted
    Accepted,
    /// Majority can no longer be reached
    Rejected,
    /// Pending past its time-to-live
    Expired,
}

impl ProposalStatus {
    /// Check whether the status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

/// A pending cluster-wide decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Random 64-bit identifier, hex encoded
    pub id: String,

    /// Proposal kind
    pub kind: ProposalKind,

    /// Opaque payload interpreted on acceptance
    pub payload: Vec<u8>,

    /// Node that proposed the change
    pub proposer: NodeId,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Lifecycle status
    pub status: ProposalStatus,

    /// Per-node accept/reject votes
    pub votes: HashMap<NodeId, bool>,

    /// Result payload set on execution
    pub result: Option<Vec<u8>>,
}

impl Proposal {
    /// Create a pending proposal with a fresh random id. The proposer's own
    /// vote is recorded as an acceptance.
    pub fn new(kind: ProposalKind, payload: Vec<u8>, proposer: NodeId) -> Self {
        let mut votes = HashMap::new();
        votes.insert(proposer.clone(), true);
        Self {
            id: format!("{:016x}", OsRng.next_u64()),
            kind,
            payload,
            proposer,
            created_at: Utc::now(),
            status: ProposalStatus::Pending,
            votes,
            result: None,
        }
    }

    /// Record one node's vote. Later votes from the same node are ignored.
    pub fn record_vote(&mut self, from: NodeId, accept: bool) {
        self.votes.entry(from).or_insert(accept);
    }

    /// Number of accepting votes.
    pub fn accept_count(&self) -> usize {
        self.votes.values().filter(|&&v| v).count()
    }

    /// Number of rejecting votes.
    pub fn reject_count(&self) -> usize {
        self.votes.values().filter(|&&v| !v).count()
    }

    /// Check whether the proposal outlived `ttl` while still pending.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        self.status == ProposalStatus::Pending
            && (now - self.created_at).to_std().unwrap_or_default() >= ttl
    }

    /// Check whether a terminal proposal is old enough to be dropped.
    pub fn is_past_retention(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        (now - self.created_at).to_std().unwrap_or_default() >= ttl
    }
}

/// Payload of a leadership-change proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadershipChange {
    /// Node that should become leader
    pub new_leader: NodeId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_proposal_is_pending() {
        let p = Proposal::new(ProposalKind::ConfigChange, vec![1, 2], NodeId::new("n1"));
        assert_eq!(p.id.len(), 16);
        assert_eq!(p.status, ProposalStatus::Pending);
        assert_eq!(p.accept_count(), 1);
    }

    #[test]
    fn test_votes_are_first_write_wins() {
        let mut p = Proposal::new(ProposalKind::Operation, vec![], NodeId::new("n1"));
        p.record_vote(NodeId::new("n2"), true);
        p.record_vote(NodeId::new("n2"), false);
        p.record_vote(NodeId::new("n3"), false);

        assert_eq!(p.accept_count(), 2);
        assert_eq!(p.reject_count(), 1);
    }

    #[test]
    fn test_expiry() {
        let mut p = Proposal::new(ProposalKind::LeadershipChange, vec![], NodeId::new("n1"));
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert!(!p.is_expired(Utc::now(), Duration::from_secs(30)));
        assert!(p.is_expired(later, Duration::from_secs(30)));

        p.status = ProposalStatus::Accepted;
        assert!(!p.is_expired(later, Duration::from_secs(30)));
    }
}
