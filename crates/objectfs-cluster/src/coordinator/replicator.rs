//! Asynchronous write replication.
//!
//! Replication tasks are decoupled from the originating operation's reply
//! path: the caller gets its result from the primary while the replicator
//! carries the payload to the remaining targets in the background.

use super::operation::DistributedOperation;
use super::OperationExecutor;
use crate::node::NodeDescriptor;
use crate::stats::ClusterStats;
use crate::tasks::Shutdown;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Attempts before a task is abandoned.
const MAX_ATTEMPTS: u32 = 3;

/// Smoothing factor for replication latency.
const LATENCY_ALPHA: f64 = 0.1;

/// One pending replication unit, owned exclusively by the queue.
#[derive(Debug, Clone)]
pub struct ReplicationTask {
    /// Operation key the task replicates
    pub key: String,

    /// The write to re-execute on each target
    pub operation: DistributedOperation,

    /// Remaining targets
    pub targets: Vec<NodeDescriptor>,

    /// Attempts made so far
    pub attempts: u32,

    /// When the task was enqueued
    pub created_at: DateTime<Utc>,
}

impl ReplicationTask {
    /// Create a task for `operation` against `targets`.
    pub fn new(operation: DistributedOperation, targets: Vec<NodeDescriptor>) -> Self {
        Self {
            key: operation.key.clone(),
            operation,
            targets,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Bytes the task carries.
    pub fn payload_len(&self) -> usize {
        self.operation.payload.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Replication counters, owned by the replicator.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Tasks waiting in the queue
    pub pending: usize,

    /// Tasks accepted by at least one peer
    pub tasks_completed: u64,

    /// Tasks abandoned after the attempt budget
    pub tasks_failed: u64,

    /// Payload bytes successfully replicated
    pub bytes_replicated: u64,

    /// Smoothed per-task replication latency in milliseconds
    pub avg_latency_ms: f64,
}

/// Background replication queue and worker.
pub struct Replicator {
    /// Pending tasks keyed by operation key
    queue: Mutex<HashMap<String, ReplicationTask>>,

    executor: Arc<dyn OperationExecutor>,

    stats: RwLock<ReplicationStats>,

    counters: Arc<RwLock<ClusterStats>>,

    shutdown: Shutdown,
}

impl Replicator {
    /// Create an idle replicator.
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        counters: Arc<RwLock<ClusterStats>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            queue: Mutex::new(HashMap::new()),
            executor,
            stats: RwLock::new(ReplicationStats::default()),
            counters,
            shutdown,
        }
    }

    /// Queue a task; a newer task for the same key replaces the older one.
    pub fn enqueue(&self, task: ReplicationTask) {
        if task.targets.is_empty() {
            return;
        }
        debug!(key = %task.key, targets = task.targets.len(), "replication task queued");
        let mut queue = self.queue.lock();
        queue.insert(task.key.clone(), task);
        self.stats.write().pending = queue.len();
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Replication snapshot.
    pub fn stats(&self) -> ReplicationStats {
        let mut stats = self.stats.read().clone();
        stats.pending = self.pending();
        stats
    }

    /// Drain the queue once, attempting every pending task.
    ///
    /// The queue lock is never held across an executor call: tasks are taken
    /// out, attempted, and requeued only when they still have budget left.
    pub async fn process_pending(&self) {
        let tasks: Vec<ReplicationTask> = {
            let mut queue = self.queue.lock();
            queue.drain().map(|(_, task)| task).collect()
        };

        for mut task in tasks {
            let started = Instant::now();
            let mut accepted = false;

            for target in &task.targets {
                match self.executor.execute(target, &task.operation).await {
                    Ok(_) => accepted = true,
                    Err(e) => {
                        debug!(key = %task.key, node = %target.id, error = %e, "replica attempt failed")
                    }
                }
            }
            task.attempts += 1;

            if accepted {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                let mut stats = self.stats.write();
                stats.tasks_completed += 1;
                stats.bytes_replicated += task.payload_len() as u64;
                if stats.avg_latency_ms == 0.0 {
                    stats.avg_latency_ms = latency_ms;
                } else {
                    stats.avg_latency_ms =
                        LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * stats.avg_latency_ms;
                }
                drop(stats);
                self.counters.write().record_replication_event();
            } else if task.attempts >= MAX_ATTEMPTS {
                warn!(key = %task.key, attempts = task.attempts, "replication task abandoned");
                self.stats.write().tasks_failed += 1;
            } else {
                self.queue.lock().insert(task.key.clone(), task);
            }
        }

        let pending = self.pending();
        self.stats.write().pending = pending;
    }

    /// Worker loop draining the queue every second.
    pub async fn worker_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.signal();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.process_pending().await,
                _ = shutdown.wait() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::operation::OperationKind;
    use crate::coordinator::MockOperationExecutor;
    use crate::node::NodeId;

    fn target(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::new(id), "127.0.0.1:9200".parse().unwrap())
    }

    fn put(key: &str, payload: Vec<u8>) -> DistributedOperation {
        DistributedOperation::new(OperationKind::Put, key).with_payload(payload)
    }

    fn replicator(executor: MockOperationExecutor) -> Replicator {
        Replicator::new(
            Arc::new(executor),
            Arc::new(RwLock::new(ClusterStats::default())),
            Shutdown::new(),
        )
    }

    #[tokio::test]
    async fn test_task_completes_on_first_acceptance() {
        let mut executor = MockOperationExecutor::new();
        executor.expect_execute().returning(|_, _| Ok(None));
        let replicator = replicator(executor);

        replicator.enqueue(ReplicationTask::new(
            put("k", vec![1, 2, 3]),
            vec![target("n2"), target("n3")],
        ));
        replicator.process_pending().await;

        let stats = replicator.stats();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.bytes_replicated, 3);
        assert_eq!(stats.pending, 0);
        assert!(stats.avg_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_task_fails_after_three_attempts() {
        let mut executor = MockOperationExecutor::new();
        executor
            .expect_execute()
            .returning(|_, _| Err(crate::error::ClusterError::Network("down".to_string())));
        let replicator = replicator(executor);

        replicator.enqueue(ReplicationTask::new(put("k", vec![1]), vec![target("n2")]));

        replicator.process_pending().await;
        assert_eq!(replicator.pending(), 1);
        replicator.process_pending().await;
        assert_eq!(replicator.pending(), 1);
        replicator.process_pending().await;

        let stats = replicator.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(stats.tasks_completed, 0);
    }

    #[tokio::test]
    async fn test_same_key_replaces_pending_task() {
        let executor = MockOperationExecutor::new();
        let replicator = replicator(executor);

        replicator.enqueue(ReplicationTask::new(put("k", vec![1]), vec![target("n2")]));
        replicator.enqueue(ReplicationTask::new(put("k", vec![2]), vec![target("n2")]));

        assert_eq!(replicator.pending(), 1);
    }
}
