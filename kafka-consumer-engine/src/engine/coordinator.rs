use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::in_flight::InFlightCounter;
use crate::engine::partition_worker::{PartitionWorker, PartitionWorkerConfig};
use crate::engine::registry::WorkerRegistry;
use crate::kafka::broker::BrokerClient;
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::Partition;
use crate::metrics_const::{ENGINE_COMMITS_COUNTER, WORKER_LIFECYCLE_COUNTER};

/// Outcome of stopping a set of workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetireSummary {
    pub stopped: usize,
    pub abandoned: usize,
    pub not_attempted: usize,
}

/// Consumer group coordinator: turns assign/revoke/lost events into worker
/// lifecycle changes. Every structural change to the registry happens under
/// `lock`, one rebalance at a time.
pub struct Coordinator {
    registry: Arc<WorkerRegistry>,
    broker: Arc<dyn BrokerClient>,
    in_flight: Arc<InFlightCounter>,
    worker_config: PartitionWorkerConfig,
    stop_timeout: Duration,
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl Coordinator {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        broker: Arc<dyn BrokerClient>,
        in_flight: Arc<InFlightCounter>,
        worker_config: PartitionWorkerConfig,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            in_flight,
            worker_config,
            stop_timeout,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Install a worker for every partition that has none, or whose worker is
    /// closing. A closing worker must reach `Done` before its replacement is
    /// installed.
    pub async fn assign(&self, partitions: &[Partition]) {
        let _guard = self.lock.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            warn!(
                partitions = partitions.len(),
                "Ignoring assignment, engine is shutting down"
            );
            return;
        }

        self.refresh_partition_counts(partitions).await;

        for partition in partitions {
            let Some(binding) = self.registry.binding(partition.topic()) else {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "No processor registered for topic, ignoring assignment"
                );
                continue;
            };

            if let Some(existing) = self.registry.get(partition) {
                if !existing.is_closing() {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "Partition already assigned, keeping existing worker"
                    );
                    continue;
                }

                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Waiting for closing worker before reassigning partition"
                );
                if !existing.wait_done(self.stop_timeout).await {
                    existing.abandon().await;
                }
                self.registry.remove_worker(&existing);
            }

            let partition_count = self
                .registry
                .partition_count(partition.topic())
                .unwrap_or_default();

            let worker = PartitionWorker::spawn(
                partition.clone(),
                partition_count,
                binding.config.mode(),
                binding.processor.clone(),
                self.in_flight.clone(),
                &self.worker_config,
            );
            self.registry.insert(worker);

            metrics::counter!(WORKER_LIFECYCLE_COUNTER, "action" => "created").increment(1);
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                partition_count,
                "Partition worker installed"
            );
        }
    }

    /// Stop the named active partitions in parallel, drop them from the
    /// registry, then commit. Returns the number of records that were never
    /// attempted because a worker missed its deadline.
    pub async fn revoke(&self, partitions: &[Partition]) -> usize {
        let _guard = self.lock.lock().await;

        let workers: Vec<Arc<PartitionWorker>> = partitions
            .iter()
            .filter_map(|p| self.registry.get(p))
            .collect();

        if workers.is_empty() {
            debug!(
                partitions = partitions.len(),
                "No active workers for revoked partitions"
            );
            return 0;
        }

        let summary = self.retire(workers, self.stop_timeout).await;
        info!(
            stopped = summary.stopped,
            abandoned = summary.abandoned,
            not_attempted = summary.not_attempted,
            "Revoked partition workers"
        );

        // best effort, the next owner re-processes from the last committed offset
        match self.broker.commit().await {
            Ok(()) => {
                metrics::counter!(ENGINE_COMMITS_COUNTER, "trigger" => "revoke", "status" => "success")
                    .increment(1);
            }
            Err(e) => {
                warn!(error = ?e, "Failed to commit offsets after revocation");
                metrics::counter!(ENGINE_COMMITS_COUNTER, "trigger" => "revoke", "status" => "error")
                    .increment(1);
            }
        }

        summary.not_attempted
    }

    /// Stop every worker for shutdown. Later assignments are ignored.
    pub async fn stop_all(&self, timeout: Duration) -> RetireSummary {
        let _guard = self.lock.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        let workers = self.registry.workers();
        info!(workers = workers.len(), "Stopping all partition workers");
        self.retire(workers, timeout).await
    }

    /// Stop workers in parallel with a shared deadline; abandon stragglers
    async fn retire(&self, workers: Vec<Arc<PartitionWorker>>, timeout: Duration) -> RetireSummary {
        let deadline = Instant::now() + timeout;

        let results = join_all(workers.iter().map(|worker| async move {
            let remaining = || deadline.saturating_duration_since(Instant::now());
            // a worker closed by someone else only needs waiting on
            let done = worker.stop(remaining()).await || worker.wait_done(remaining()).await;
            if done {
                None
            } else {
                Some(worker.abandon().await)
            }
        }))
        .await;

        let mut summary = RetireSummary::default();
        for (worker, result) in workers.iter().zip(results) {
            self.registry.remove_worker(worker);
            match result {
                None => {
                    summary.stopped += 1;
                    metrics::counter!(WORKER_LIFECYCLE_COUNTER, "action" => "stopped").increment(1);
                }
                Some(not_attempted) => {
                    summary.abandoned += 1;
                    summary.not_attempted += not_attempted;
                    metrics::counter!(WORKER_LIFECYCLE_COUNTER, "action" => "abandoned")
                        .increment(1);
                }
            }
        }

        summary
    }

    async fn refresh_partition_counts(&self, partitions: &[Partition]) {
        let topics: BTreeSet<&str> = partitions
            .iter()
            .map(Partition::topic)
            .filter(|topic| self.registry.binding(topic).is_some())
            .collect();

        for topic in topics {
            match self.broker.partition_count(topic).await {
                Ok(count) => self.registry.set_partition_count(topic, count),
                Err(e) => warn!(
                    topic,
                    cached = ?self.registry.partition_count(topic),
                    error = ?e,
                    "Failed to refresh partition count, keeping cached value"
                ),
            }
        }
    }
}

#[async_trait]
impl RebalanceHandler for Coordinator {
    async fn on_partitions_assigned(&self, partitions: &[Partition]) {
        self.assign(partitions).await;
    }

    async fn on_partitions_revoked(&self, partitions: &[Partition]) {
        self.revoke(partitions).await;
    }

    async fn on_partitions_lost(&self, partitions: &[Partition]) {
        // the group already moved on, so the commit will usually fail and be logged
        warn!(partitions = partitions.len(), "Partitions lost, retiring workers");
        self.revoke(partitions).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::partition_worker::WorkerState;
    use crate::engine::registry::{ConsumerTopicConfig, TopicBinding};
    use crate::engine::processor::Processor;
    use crate::test_utils::{make_records, MockBrokerClient, RecordingProcessor};

    struct Fixture {
        coordinator: Coordinator,
        registry: Arc<WorkerRegistry>,
        broker: Arc<MockBrokerClient>,
        in_flight: Arc<InFlightCounter>,
    }

    fn fixture(processor: Arc<dyn Processor>, stop_timeout: Duration) -> Fixture {
        let registry = Arc::new(WorkerRegistry::new(vec![TopicBinding {
            config: ConsumerTopicConfig::new("orders", true),
            processor,
        }]));
        let broker = Arc::new(MockBrokerClient::new().with_partition_count("orders", 2));
        let in_flight = Arc::new(InFlightCounter::new());
        let coordinator = Coordinator::new(
            registry.clone(),
            broker.clone(),
            in_flight.clone(),
            PartitionWorkerConfig::default(),
            stop_timeout,
        );
        Fixture {
            coordinator,
            registry,
            broker,
            in_flight,
        }
    }

    #[tokio::test]
    async fn test_assign_is_idempotent_for_active_partition() {
        let f = fixture(Arc::new(RecordingProcessor::new()), Duration::from_secs(1));
        let p0 = Partition::new("orders", 0);

        f.coordinator.assign(&[p0.clone()]).await;
        let first = f.registry.get(&p0).unwrap();
        f.coordinator.assign(&[p0.clone()]).await;
        let second = f.registry.get(&p0).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.partition_count("orders"), Some(2));
    }

    #[tokio::test]
    async fn test_assign_ignores_unknown_topics() {
        let f = fixture(Arc::new(RecordingProcessor::new()), Duration::from_secs(1));

        f.coordinator
            .assign(&[Partition::new("payments", 0), Partition::new("orders", 1)])
            .await;

        assert_eq!(f.registry.partitions(), vec![Partition::new("orders", 1)]);
    }

    #[tokio::test]
    async fn test_partition_count_refresh_failure_keeps_cached_value() {
        let f = fixture(Arc::new(RecordingProcessor::new()), Duration::from_secs(1));
        f.registry.set_partition_count("orders", 8);
        f.broker.fail_partition_count("orders");

        f.coordinator.assign(&[Partition::new("orders", 0)]).await;

        assert_eq!(f.registry.partition_count("orders"), Some(8));
    }

    #[tokio::test]
    async fn test_revoke_drains_then_commits() {
        let processor = Arc::new(RecordingProcessor::new().with_delay(Duration::from_millis(5)));
        let f = fixture(processor.clone(), Duration::from_secs(5));
        let p0 = Partition::new("orders", 0);

        f.coordinator.assign(&[p0.clone()]).await;
        let worker = f.registry.get(&p0).unwrap();
        worker
            .enqueue(make_records("orders", 0, ["a"; 10], 0))
            .unwrap();

        let not_attempted = f.coordinator.revoke(&[p0.clone()]).await;

        assert_eq!(not_attempted, 0);
        assert_eq!(processor.count(), 10);
        assert!(worker.is_done());
        assert!(f.registry.get(&p0).is_none());
        assert_eq!(f.broker.commit_count(), 1);
        assert_eq!(f.in_flight.current(), 0);
    }

    #[tokio::test]
    async fn test_revoke_without_active_workers_skips_commit() {
        let f = fixture(Arc::new(RecordingProcessor::new()), Duration::from_secs(1));

        f.coordinator.revoke(&[Partition::new("orders", 0)]).await;

        assert_eq!(f.broker.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_revoke_abandons_worker_past_deadline() {
        let processor = Arc::new(RecordingProcessor::new().with_delay(Duration::from_secs(60)));
        let f = fixture(processor, Duration::from_millis(50));
        let p0 = Partition::new("orders", 0);

        f.coordinator.assign(&[p0.clone()]).await;
        f.registry
            .get(&p0)
            .unwrap()
            .enqueue(make_records("orders", 0, ["a"; 3], 0))
            .unwrap();

        let not_attempted = f.coordinator.revoke(&[p0]).await;

        assert_eq!(not_attempted, 3);
        assert_eq!(f.in_flight.current(), 0);
        assert_eq!(f.broker.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_reassign_waits_for_closing_worker() {
        let processor = Arc::new(RecordingProcessor::new().with_delay(Duration::from_millis(20)));
        let f = fixture(processor.clone(), Duration::from_secs(5));
        let p0 = Partition::new("orders", 0);

        f.coordinator.assign(&[p0.clone()]).await;
        let old = f.registry.get(&p0).unwrap();
        old.enqueue(make_records("orders", 0, ["a"; 5], 0)).unwrap();

        let stopping = {
            let old = old.clone();
            tokio::spawn(async move { old.stop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(old.state(), WorkerState::Closing);

        f.coordinator.assign(&[p0.clone()]).await;

        assert!(old.is_done());
        assert_eq!(processor.count(), 5);
        let replacement = f.registry.get(&p0).unwrap();
        assert!(!Arc::ptr_eq(&old, &replacement));
        assert_eq!(replacement.state(), WorkerState::Assigned);
        assert!(stopping.await.unwrap());
    }

    #[tokio::test]
    async fn test_assign_after_stop_all_is_ignored() {
        let f = fixture(Arc::new(RecordingProcessor::new()), Duration::from_secs(1));
        f.coordinator.assign(&[Partition::new("orders", 0)]).await;

        let summary = f.coordinator.stop_all(Duration::from_secs(1)).await;
        assert_eq!(summary.stopped, 1);
        assert!(f.registry.is_empty());

        f.coordinator.assign(&[Partition::new("orders", 1)]).await;
        assert!(f.registry.is_empty());
    }
}
