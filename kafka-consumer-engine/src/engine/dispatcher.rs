use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::coordinator::Coordinator;
use crate::engine::in_flight::InFlightCounter;
use crate::engine::partition_worker::PartitionWorker;
use crate::engine::registry::WorkerRegistry;
use crate::kafka::broker::{BrokerClient, PartitionRecords};
use crate::kafka::message::Record;
use crate::kafka::types::Partition;
use crate::metrics_const::{
    BARRIER_WAIT_DURATION_HISTOGRAM, FETCH_ERRORS_COUNTER, RECORDS_DISPATCHED_COUNTER,
    RECORDS_DROPPED_COUNTER, RECORDS_ORPHANED_COUNTER,
};

/// What to do with fetched records whose partition has no worker. This
/// happens when a fetch is delivered before the rebalance callback that
/// assigns the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Log and discard. The records are re-fetched by whichever consumer
    /// owns the partition, since their offsets are never committed here.
    #[default]
    Drop,
    /// Assign the partitions locally, process the records, then revoke again
    SelfHeal,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(OrphanPolicy::Drop),
            "self_heal" | "self-heal" | "selfheal" => Ok(OrphanPolicy::SelfHeal),
            other => Err(format!(
                "unknown orphan policy '{other}', expected 'drop' or 'self_heal'"
            )),
        }
    }
}

/// The poll loop: fetch, route sub-batches to partition workers, then hold
/// the next fetch (and any pending rebalance) until every dispatched record
/// is processed.
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    coordinator: Arc<Coordinator>,
    broker: Arc<dyn BrokerClient>,
    in_flight: Arc<InFlightCounter>,
    max_fetch_records: usize,
    orphan_policy: OrphanPolicy,
    // held for a whole cycle so shutdown can wait out an in-progress fetch
    cycle: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        coordinator: Arc<Coordinator>,
        broker: Arc<dyn BrokerClient>,
        in_flight: Arc<InFlightCounter>,
        max_fetch_records: usize,
        orphan_policy: OrphanPolicy,
    ) -> Self {
        Self {
            registry,
            coordinator,
            broker,
            in_flight,
            max_fetch_records,
            orphan_policy,
            cycle: Mutex::new(()),
        }
    }

    /// Run one fetch/dispatch/barrier cycle. Returns true when the loop
    /// should stop: the client is closed, or `cancel` fired.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> bool {
        let _cycle = self.cycle.lock().await;

        if cancel.is_cancelled() {
            return true;
        }

        // not raced against cancel: records already consumed must reach a worker
        let fetch = match self.broker.fetch(self.max_fetch_records).await {
            Ok(fetch) => fetch,
            Err(e) if e.is_terminal() => {
                info!(error = %e, "Broker client stopped, leaving poll loop");
                return true;
            }
            Err(e) => {
                warn!(error = ?e, "Fetch failed, retrying next cycle");
                metrics::counter!(FETCH_ERRORS_COUNTER, "scope" => "fetch").increment(1);
                return false;
            }
        };

        for failure in &fetch.errors {
            match &failure.partition {
                Some(partition) => warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = ?failure.error,
                    "Fetch error for partition, skipping this cycle"
                ),
                None => warn!(error = ?failure.error, "Fetch error, skipping this cycle"),
            }
            metrics::counter!(FETCH_ERRORS_COUNTER, "scope" => "partition").increment(1);
        }

        let mut orphans = Vec::new();
        for batch in fetch.partitions {
            match self.registry.get(&batch.partition) {
                Some(worker) => self.dispatch(&worker, batch.records),
                None => orphans.push(batch),
            }
        }

        if !orphans.is_empty() {
            self.handle_orphans(orphans).await;
        }

        let barrier_start = Instant::now();
        tokio::select! {
            _ = self.in_flight.wait_for_zero() => {}
            _ = cancel.cancelled() => {
                info!(
                    in_flight = self.in_flight.current(),
                    "Cancelled while waiting for in-flight records"
                );
                return true;
            }
        }
        metrics::histogram!(BARRIER_WAIT_DURATION_HISTOGRAM)
            .record(barrier_start.elapsed().as_secs_f64());

        self.broker.allow_rebalance();
        false
    }

    /// Wait for an in-progress cycle to finish, up to `timeout`
    pub async fn quiesce(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.cycle.lock()).await.is_ok()
    }

    fn dispatch(&self, worker: &PartitionWorker, records: Vec<Record>) {
        let partition = worker.partition();
        let count = records.len();

        if worker.is_closing() {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                records = count,
                "Worker is closing, dropping records"
            );
            metrics::counter!(RECORDS_DROPPED_COUNTER, "reason" => "closing")
                .increment(count as u64);
            return;
        }

        match worker.enqueue(records) {
            Ok(()) => {
                metrics::counter!(RECORDS_DISPATCHED_COUNTER, "topic" => partition.topic().to_string())
                    .increment(count as u64);
            }
            Err(e) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "Failed to enqueue records, dropping"
                );
                metrics::counter!(RECORDS_DROPPED_COUNTER, "reason" => "enqueue_failed")
                    .increment(e.rejected() as u64);
            }
        }
    }

    async fn handle_orphans(&self, orphans: Vec<PartitionRecords>) {
        let partitions: Vec<Partition> = orphans.iter().map(|b| b.partition.clone()).collect();
        let records: usize = orphans.iter().map(|b| b.records.len()).sum();

        match self.orphan_policy {
            OrphanPolicy::Drop => {
                warn!(
                    partitions = ?partitions,
                    records,
                    "Records fetched for partitions without a worker, dropping"
                );
                metrics::counter!(RECORDS_ORPHANED_COUNTER, "policy" => "drop")
                    .increment(records as u64);
            }
            OrphanPolicy::SelfHeal => {
                warn!(
                    partitions = ?partitions,
                    records,
                    "Records fetched for partitions without a worker, assigning locally"
                );
                metrics::counter!(RECORDS_ORPHANED_COUNTER, "policy" => "self_heal")
                    .increment(records as u64);

                self.coordinator.assign(&partitions).await;
                for batch in orphans {
                    match self.registry.get(&batch.partition) {
                        Some(worker) => self.dispatch(&worker, batch.records),
                        None => debug!(
                            topic = batch.partition.topic(),
                            partition = batch.partition.partition_number(),
                            "No worker after local assignment, dropping records"
                        ),
                    }
                }
                self.coordinator.revoke(&partitions).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::engine::partition_worker::PartitionWorkerConfig;
    use crate::engine::processor::Processor;
    use crate::engine::registry::{ConsumerTopicConfig, TopicBinding};
    use crate::kafka::broker::{BrokerError, Fetch};
    use crate::kafka::rebalance_handler::RebalanceHandler;
    use crate::test_utils::{make_fetch, MockBrokerClient, RecordingProcessor, ScriptStep};

    struct Fixture {
        dispatcher: Dispatcher,
        coordinator: Arc<Coordinator>,
        broker: Arc<MockBrokerClient>,
        in_flight: Arc<InFlightCounter>,
    }

    fn fixture(
        broker: MockBrokerClient,
        processor: Arc<dyn Processor>,
        orphan_policy: OrphanPolicy,
    ) -> Fixture {
        let registry = Arc::new(WorkerRegistry::new(vec![TopicBinding {
            config: ConsumerTopicConfig::new("orders", false),
            processor,
        }]));
        let broker = Arc::new(broker);
        let in_flight = Arc::new(InFlightCounter::new());
        broker.monitor_in_flight(in_flight.clone());

        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            broker.clone(),
            in_flight.clone(),
            PartitionWorkerConfig::default(),
            Duration::from_secs(5),
        ));
        let handler: Arc<dyn RebalanceHandler> = coordinator.clone();
        broker.register_rebalance_handler(Arc::downgrade(&handler));

        let dispatcher = Dispatcher::new(
            registry,
            coordinator.clone(),
            broker.clone(),
            in_flight.clone(),
            100,
            orphan_policy,
        );

        Fixture {
            dispatcher,
            coordinator,
            broker,
            in_flight,
        }
    }

    #[rstest]
    #[case("drop", OrphanPolicy::Drop)]
    #[case("self_heal", OrphanPolicy::SelfHeal)]
    #[case("Self-Heal", OrphanPolicy::SelfHeal)]
    fn test_orphan_policy_from_str(#[case] input: &str, #[case] expected: OrphanPolicy) {
        assert_eq!(input.parse::<OrphanPolicy>().unwrap(), expected);
    }

    #[test]
    fn test_orphan_policy_rejects_unknown() {
        assert!("retry".parse::<OrphanPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_poll_once_dispatches_and_waits_for_barrier() {
        let p0 = Partition::new("orders", 0);
        let processor = Arc::new(RecordingProcessor::new().with_delay(Duration::from_millis(2)));
        let broker = MockBrokerClient::new().with_script(vec![
            ScriptStep::Assign(vec![p0.clone()]),
            ScriptStep::Records(make_fetch("orders", 0, ["a", "b", "a", "c"], 0)),
            ScriptStep::Records(make_fetch("orders", 0, ["a", "b"], 4)),
        ]);
        let f = fixture(broker, processor.clone(), OrphanPolicy::Drop);
        let cancel = CancellationToken::new();

        assert!(!f.dispatcher.poll_once(&cancel).await);
        // the barrier held until everything from the first fetch was processed
        assert_eq!(f.in_flight.current(), 0);
        assert_eq!(processor.count(), 4);

        assert!(!f.dispatcher.poll_once(&cancel).await);
        assert_eq!(processor.count(), 6);

        // script exhausted, client reports closed
        assert!(f.dispatcher.poll_once(&cancel).await);
        assert_eq!(f.broker.fetch_while_in_flight(), 0);
        assert_eq!(f.broker.allow_rebalance_count(), 2);
    }

    #[rstest]
    #[case(OrphanPolicy::Drop, 0, 0)]
    #[case(OrphanPolicy::SelfHeal, 3, 1)]
    #[tokio::test]
    async fn test_orphaned_records_follow_policy(
        #[case] policy: OrphanPolicy,
        #[case] expected_processed: usize,
        #[case] expected_commits: usize,
    ) {
        let processor = Arc::new(RecordingProcessor::new());
        let broker = MockBrokerClient::new().with_script(vec![ScriptStep::Records(make_fetch(
            "orders",
            1,
            ["a", "b", "c"],
            0,
        ))]);
        let f = fixture(broker, processor.clone(), policy);

        assert!(!f.dispatcher.poll_once(&CancellationToken::new()).await);

        assert_eq!(processor.count(), expected_processed);
        assert_eq!(f.broker.commit_count(), expected_commits);
        assert_eq!(f.in_flight.current(), 0);
        // self-heal revokes right away, so no worker survives either way
        assert!(f.dispatcher.registry.is_empty());
    }

    #[tokio::test]
    async fn test_non_terminal_fetch_error_continues() {
        let broker = MockBrokerClient::new().with_script(vec![
            ScriptStep::Error(BrokerError::UnknownTopic("orders".to_string())),
            ScriptStep::Records(Fetch::new()),
        ]);
        let f = fixture(broker, Arc::new(RecordingProcessor::new()), OrphanPolicy::Drop);
        let cancel = CancellationToken::new();

        assert!(!f.dispatcher.poll_once(&cancel).await);
        assert!(!f.dispatcher.poll_once(&cancel).await);
        assert!(f.dispatcher.poll_once(&cancel).await);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_without_fetching() {
        let broker = MockBrokerClient::new().with_script(vec![ScriptStep::Records(Fetch::new())]);
        let f = fixture(broker, Arc::new(RecordingProcessor::new()), OrphanPolicy::Drop);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(f.dispatcher.poll_once(&cancel).await);
        assert_eq!(f.broker.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_records_for_closing_worker_are_dropped() {
        let p0 = Partition::new("orders", 0);
        let processor = Arc::new(RecordingProcessor::new());
        let broker = MockBrokerClient::new().with_script(vec![
            ScriptStep::Records(make_fetch("orders", 0, ["a", "b"], 0)),
        ]);
        let f = fixture(broker, processor.clone(), OrphanPolicy::Drop);

        f.coordinator.assign(&[p0.clone()]).await;
        let worker = f.dispatcher.registry.get(&p0).unwrap();
        assert!(worker.stop(Duration::from_secs(1)).await);

        assert!(!f.dispatcher.poll_once(&CancellationToken::new()).await);
        assert_eq!(processor.count(), 0);
        assert_eq!(f.in_flight.current(), 0);
    }
}
