//! Replicated command log.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tag describing what a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Placeholder entry
    Noop,
    /// Records a leadership change
    LeaderElection,
    /// Cluster configuration change
    ConfigChange,
    /// Client-visible operation
    Operation,
    /// Snapshot marker
    Snapshot,
}

/// One position in the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was appended
    pub term: u64,

    /// Position in the log
    pub index: u64,

    /// Entry tag
    pub kind: EntryKind,

    /// Opaque command payload
    pub payload: Vec<u8>,

    /// Append timestamp
    pub timestamp: DateTime<Utc>,

    /// Submitting client, when known
    pub client_id: Option<String>,

    /// Client request identifier, when known
    pub request_id: Option<String>,
}

impl LogEntry {
    /// Create a new entry.
    pub fn new(term: u64, index: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind,
            payload,
            timestamp: Utc::now(),
            client_id: None,
            request_id: None,
        }
    }

    /// The (0, 0) sentinel every log starts from.
    pub fn sentinel() -> Self {
        Self::new(0, 0, EntryKind::Noop, Vec::new())
    }
}

/// In-memory append-only log, contiguous in index.
#[derive(Debug)]
pub struct ReplicatedLog {
    /// Entries; `entries[i].index == i` always holds
    entries: Vec<LogEntry>,

    /// Highest index known to be committed
    commit_index: u64,

    /// Highest index applied to the state machine
    last_applied: u64,
}

impl ReplicatedLog {
    /// Create a log holding only the sentinel.
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
            commit_index: 0,
            last_applied: 0,
        }
    }

    /// Append a new entry for `term`, returning its index.
    pub fn append(&mut self, term: u64, kind: EntryKind, payload: Vec<u8>) -> u64 {
        let index = self.entries.len() as u64;
        self.entries.push(LogEntry::new(term, index, kind, payload));
        index
    }

    /// Install entries shipped by the leader, truncating any conflicting
    /// suffix first. Entries must be contiguous starting at
    /// `entries[0].index`.
    pub fn install(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            let index = entry.index as usize;
            if index < self.entries.len() {
                if self.entries[index].term != entry.term {
                    self.entries.truncate(index);
                    self.entries.push(entry);
                }
            } else if index == self.entries.len() {
                self.entries.push(entry);
            }
            // A gap would break contiguity; the leader retries from an
            // earlier next-index in that case.
        }
        self.commit_index = self.commit_index.min(self.last_index());
        self.last_applied = self.last_applied.min(self.commit_index);
    }

    /// Entry at `index`, if present.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    /// Entries from `start` (inclusive) onward.
    pub fn entries_from(&self, start: u64) -> Vec<LogEntry> {
        if (start as usize) < self.entries.len() {
            self.entries[start as usize..].to_vec()
        } else {
            Vec::new()
        }
    }

    /// Index of the last entry.
    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    /// Term of the last entry.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// (last index, last term) pair.
    pub fn last_info(&self) -> (u64, u64) {
        (self.last_index(), self.last_term())
    }

    /// Check whether a candidate log described by (`index`, `term`) is at
    /// least as up-to-date as this one.
    pub fn candidate_up_to_date(&self, index: u64, term: u64) -> bool {
        let (our_index, our_term) = self.last_info();
        term > our_term || (term == our_term && index >= our_index)
    }

    /// Advance the commit index, clamped to the log length.
    pub fn advance_commit(&mut self, index: u64) -> bool {
        let target = index.min(self.last_index());
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Committed entries not yet applied, in index order.
    pub fn take_unapplied(&mut self) -> Vec<LogEntry> {
        let from = (self.last_applied + 1) as usize;
        let to = (self.commit_index + 1) as usize;
        if from >= to {
            return Vec::new();
        }
        let out = self.entries[from..to].to_vec();
        self.last_applied = self.commit_index;
        out
    }

    /// Highest committed index.
    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Highest applied index.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Number of entries, sentinel included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A log never drops its sentinel.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ReplicatedLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Leader-side next/match index bookkeeping per peer.
#[derive(Debug, Default)]
pub struct PeerIndexTracker {
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
}

impl PeerIndexTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize a peer after winning an election.
    pub fn init_peer(&mut self, peer: NodeId, last_log_index: u64) {
        self.next_index.insert(peer.clone(), last_log_index + 1);
        self.match_index.insert(peer, 0);
    }

    /// Next index to ship to `peer`.
    pub fn next_index(&self, peer: &NodeId) -> u64 {
        self.next_index.get(peer).copied().unwrap_or(1)
    }

    /// Highest index known replicated on `peer`.
    pub fn match_index(&self, peer: &NodeId) -> u64 {
        self.match_index.get(peer).copied().unwrap_or(0)
    }

    /// Record a successful append reply.
    pub fn record_success(&mut self, peer: NodeId, match_index: u64) {
        self.next_index.insert(peer.clone(), match_index + 1);
        self.match_index.insert(peer, match_index);
    }

    /// Record a failed append reply; the next round retries one earlier.
    pub fn record_failure(&mut self, peer: &NodeId) {
        if let Some(next) = self.next_index.get_mut(peer) {
            if *next > 1 {
                *next -= 1;
            }
        }
    }

    /// Drop a departed peer.
    pub fn remove_peer(&mut self, peer: &NodeId) {
        self.next_index.remove(peer);
        self.match_index.remove(peer);
    }

    /// Highest index N replicated on at least `quorum` of the given peers
    /// (the leader's own last index counts as one acknowledgment).
    pub fn quorum_match(&self, peers: &[NodeId], leader_last: u64, quorum: usize) -> u64 {
        let mut acked: Vec<u64> = peers.iter().map(|p| self.match_index(p)).collect();
        acked.push(leader_last);
        acked.sort_unstable_by(|a, b| b.cmp(a));
        if quorum == 0 || quorum > acked.len() {
            return 0;
        }
        acked[quorum - 1]
    }
}
