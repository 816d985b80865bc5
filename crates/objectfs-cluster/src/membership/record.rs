//! Gossip records and suspicion bookkeeping.

use crate::node::{NodeDescriptor, NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Gossip-level liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GossipState {
    /// Node is reachable
    Alive,
    /// Node is accused of being dead
    Suspect,
    /// Node is considered dead
    Dead,
    /// Node announced a graceful departure
    Left,
}

impl GossipState {
    /// Check whether the node should still receive gossip traffic.
    pub fn is_gossipable(&self) -> bool {
        matches!(self, GossipState::Alive | GossipState::Suspect)
    }

    /// Table status corresponding to this gossip state.
    pub fn as_status(&self) -> NodeStatus {
        match self {
            GossipState::Alive => NodeStatus::Alive,
            GossipState::Suspect => NodeStatus::Suspect,
            GossipState::Dead => NodeStatus::Dead,
            GossipState::Left => NodeStatus::Leaving,
        }
    }
}

/// Open accusation against a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspicion {
    /// Incarnation the accusation targets
    pub incarnation: u64,

    /// Nodes that reported the target unreachable
    pub accusers: HashSet<NodeId>,

    /// Deadline after which the suspicion escalates to dead
    pub deadline: DateTime<Utc>,
}

impl Suspicion {
    /// Open a suspicion against `incarnation`, expiring after `timeout`.
    pub fn new(incarnation: u64, accuser: NodeId, timeout: std::time::Duration) -> Self {
        let mut accusers = HashSet::new();
        accusers.insert(accuser);
        Self {
            incarnation,
            accusers,
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        }
    }

    /// Check whether the deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// A node descriptor wrapped with gossip ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRecord {
    /// The wrapped descriptor
    pub node: NodeDescriptor,

    /// Incarnation owned by the node itself
    pub incarnation: u64,

    /// Gossip-level state
    pub state: GossipState,

    /// When the state last changed
    pub state_changed_at: DateTime<Utc>,

    /// Open accusation, if any
    pub suspicion: Option<Suspicion>,
}

impl GossipRecord {
    /// Wrap a descriptor at the given incarnation, alive.
    pub fn new(node: NodeDescriptor, incarnation: u64) -> Self {
        Self {
            node,
            incarnation,
            state: GossipState::Alive,
            state_changed_at: Utc::now(),
            suspicion: None,
        }
    }

    /// Transition to `state`, stamping the change time and syncing the
    /// descriptor status.
    pub fn mark(&mut self, state: GossipState) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = Utc::now();
        }
        self.node.status = state.as_status();
    }

    /// Decide whether an incoming record supersedes this one.
    ///
    /// Strictly greater incarnations always win. At equal incarnations the
    /// more severe state wins (dead/left > suspect > alive), so reordered
    /// duplicates converge.
    pub fn superseded_by(&self, incarnation: u64, state: GossipState) -> bool {
        if incarnation > self.incarnation {
            return true;
        }
        incarnation == self.incarnation && state_priority(state) > state_priority(self.state)
    }

    /// Duration the record has spent in its current state.
    pub fn state_age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.state_changed_at)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

fn state_priority(state: GossipState) -> u8 {
    match state {
        GossipState::Dead | GossipState::Left => 3,
        GossipState::Suspect => 2,
        GossipState::Alive => 1,
    }
}
