//! Cluster-wide counters.
//!
//! All counters live behind a dedicated lock so they never contend with the
//! membership table, and are never read or written under another subsystem's
//! mutex.

use serde::Serialize;

/// Smoothing factor for latency averages.
const LATENCY_ALPHA: f64 = 0.1;

/// Node-count totals by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeCounts {
    pub total: usize,
    pub alive: usize,
    pub suspect: usize,
    pub dead: usize,
    pub joining: usize,
    pub leaving: usize,
}

/// Cluster-wide counters, mutated under the counter lock only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    /// Node totals by status
    pub nodes: NodeCounts,

    /// Elections started by this node
    pub elections_started: u64,

    /// Operations submitted to the coordinator
    pub operations_attempted: u64,

    /// Operations that reported success
    pub operations_succeeded: u64,

    /// Operations that reported failure
    pub operations_failed: u64,

    /// Exponentially-smoothed operation latency in milliseconds
    pub avg_operation_latency_ms: f64,

    /// Aggregate cache hit rate reported by peers
    pub cache_hit_rate: f64,

    /// Replication tasks completed cluster-wide
    pub replication_events: u64,

    /// Strong-consistency shortfalls observed
    pub consistency_violations: u64,

    /// Datagrams sent
    pub messages_sent: u64,

    /// Datagrams received
    pub messages_received: u64,

    /// Bytes sent
    pub bytes_sent: u64,

    /// Bytes received
    pub bytes_received: u64,

    /// Send/receive/decode failures
    pub network_errors: u64,
}

impl ClusterStats {
    /// Record a terminal operation result.
    pub fn record_operation(&mut self, success: bool, latency_ms: f64) {
        self.operations_attempted += 1;
        if success {
            self.operations_succeeded += 1;
        } else {
            self.operations_failed += 1;
        }
        if self.avg_operation_latency_ms == 0.0 {
            self.avg_operation_latency_ms = latency_ms;
        } else {
            self.avg_operation_latency_ms = LATENCY_ALPHA * latency_ms
                + (1.0 - LATENCY_ALPHA) * self.avg_operation_latency_ms;
        }
    }

    /// Record an outbound datagram.
    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record an inbound datagram.
    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record a transport failure.
    pub fn record_network_error(&mut self) {
        self.network_errors += 1;
    }

    /// Record an election attempt.
    pub fn record_election(&mut self) {
        self.elections_started += 1;
    }

    /// Record a completed replication task.
    pub fn record_replication_event(&mut self) {
        self.replication_events += 1;
    }

    /// Record a strong-consistency shortfall.
    pub fn record_consistency_violation(&mut self) {
        self.consistency_violations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_counters() {
        let mut stats = ClusterStats::default();

        stats.record_operation(true, 10.0);
        stats.record_operation(false, 30.0);

        assert_eq!(stats.operations_attempted, 2);
        assert_eq!(stats.operations_succeeded, 1);
        assert_eq!(stats.operations_failed, 1);
        // First sample seeds the average, second blends at alpha = 0.1.
        assert!((stats.avg_operation_latency_ms - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_message_counters() {
        let mut stats = ClusterStats::default();

        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(25);
        stats.record_network_error();

        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 25);
        assert_eq!(stats.network_errors, 1);
    }
}
