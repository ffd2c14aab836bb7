//! Concurrent partitioned consumer engine.
//!
//! The coordinator installs a [`PartitionWorker`] per assigned partition, the
//! dispatcher feeds fetched records to those workers and blocks the next fetch
//! until all of them are processed, and the shutdown coordinator drains
//! everything and commits exactly once.

pub mod coordinator;
pub mod dispatcher;
pub mod in_flight;
pub mod partition_worker;
pub mod processor;
pub mod registry;
pub mod shutdown;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::kafka::broker::BrokerClient;
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::Partition;
use crate::producer::Producer;

pub use coordinator::Coordinator;
pub use dispatcher::{Dispatcher, OrphanPolicy};
pub use in_flight::InFlightCounter;
pub use partition_worker::{ConcurrencyMode, PartitionWorker, PartitionWorkerConfig, WorkerState};
pub use processor::{ProcessError, Processor};
pub use registry::{ConsumerTopicConfig, TopicBinding, WorkerRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no topics registered")]
    NoTopics,
    #[error("topic {0} registered more than once")]
    DuplicateTopic(String),
    #[error("invalid engine settings: {0}")]
    InvalidSettings(String),
    #[error("shutdown incomplete: {not_attempted} records not attempted, deadline exhausted")]
    ShutdownIncomplete { not_attempted: usize },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on records returned by one fetch
    pub max_fetch_records: usize,
    pub record_timeout: Duration,
    /// Deadline for a revoked partition's worker to drain
    pub worker_stop_timeout: Duration,
    /// Overall deadline for `close`
    pub shutdown_timeout: Duration,
    pub channel_buffer_size: usize,
    pub orphan_policy: OrphanPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_fetch_records: 500,
            record_timeout: Duration::from_secs(30),
            worker_stop_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            channel_buffer_size: 10,
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

pub struct EngineBuilder {
    broker: Arc<dyn BrokerClient>,
    topics: Vec<TopicBinding>,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn topic(mut self, config: ConsumerTopicConfig, processor: Arc<dyn Processor>) -> Self {
        self.topics.push(TopicBinding { config, processor });
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wire the components together and register the coordinator as the
    /// broker client's rebalance handler.
    pub fn build(self) -> Result<ConsumerEngine, EngineError> {
        if self.topics.is_empty() {
            return Err(EngineError::NoTopics);
        }

        let mut seen = HashSet::new();
        for binding in &self.topics {
            if !seen.insert(binding.config.topic_name.as_str()) {
                return Err(EngineError::DuplicateTopic(
                    binding.config.topic_name.clone(),
                ));
            }
        }

        if self.settings.max_fetch_records == 0 {
            return Err(EngineError::InvalidSettings(
                "max_fetch_records must be greater than zero".to_string(),
            ));
        }

        let settings = self.settings;
        let broker = self.broker;
        let registry = Arc::new(WorkerRegistry::new(self.topics));
        let in_flight = Arc::new(InFlightCounter::new());
        let cancel = CancellationToken::new();

        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            broker.clone(),
            in_flight.clone(),
            PartitionWorkerConfig {
                channel_buffer_size: settings.channel_buffer_size,
                record_timeout: settings.record_timeout,
            },
            settings.worker_stop_timeout,
        ));
        let handler: Arc<dyn RebalanceHandler> = coordinator.clone();
        broker.register_rebalance_handler(Arc::downgrade(&handler));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            coordinator.clone(),
            broker.clone(),
            in_flight.clone(),
            settings.max_fetch_records,
            settings.orphan_policy,
        ));

        let shutdown = ShutdownCoordinator::new(
            cancel.clone(),
            dispatcher.clone(),
            coordinator,
            broker.clone(),
            settings.shutdown_timeout,
        );

        info!(
            topics = ?registry.topics().collect::<Vec<_>>(),
            max_fetch_records = settings.max_fetch_records,
            orphan_policy = ?settings.orphan_policy,
            "Consumer engine built"
        );

        Ok(ConsumerEngine {
            registry,
            dispatcher,
            shutdown,
            in_flight,
            cancel,
            producer: Producer::new(broker),
        })
    }
}

pub struct ConsumerEngine {
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownCoordinator,
    in_flight: Arc<InFlightCounter>,
    cancel: CancellationToken,
    producer: Producer,
}

impl ConsumerEngine {
    pub fn builder(broker: Arc<dyn BrokerClient>) -> EngineBuilder {
        EngineBuilder {
            broker,
            topics: Vec::new(),
            settings: EngineSettings::default(),
        }
    }

    /// Drive the poll loop until the broker client closes or the engine is
    /// cancelled, then run the shutdown sequence.
    pub async fn run(&self) -> Result<ShutdownReport, EngineError> {
        info!("Starting consumer engine poll loop");
        while !self.dispatcher.poll_once(&self.cancel).await {}
        info!("Poll loop exited");
        self.close().await
    }

    /// Run one fetch/dispatch/barrier cycle
    pub async fn poll_once(&self) -> bool {
        self.dispatcher.poll_once(&self.cancel).await
    }

    /// Stop consuming, drain all workers, commit, flush, and release the
    /// broker client. Safe to call concurrently and repeatedly; every call
    /// returns the outcome of the single shutdown run.
    pub async fn close(&self) -> Result<ShutdownReport, EngineError> {
        self.shutdown.close().await
    }

    pub fn is_done(&self) -> bool {
        self.shutdown.is_done()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn in_flight(&self) -> Arc<InFlightCounter> {
        self.in_flight.clone()
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn active_partitions(&self) -> Vec<Partition> {
        self.registry.partitions()
    }

    pub fn worker(&self, partition: &Partition) -> Option<Arc<PartitionWorker>> {
        self.registry.get(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_fetch, MockBrokerClient, RecordingProcessor, ScriptStep};

    fn broker() -> Arc<dyn BrokerClient> {
        Arc::new(MockBrokerClient::new())
    }

    #[test]
    fn test_build_requires_topics() {
        let result = ConsumerEngine::builder(broker()).build();
        assert!(matches!(result, Err(EngineError::NoTopics)));
    }

    #[test]
    fn test_build_rejects_duplicate_topics() {
        let processor = Arc::new(RecordingProcessor::new());
        let result = ConsumerEngine::builder(broker())
            .topic(ConsumerTopicConfig::new("orders", false), processor.clone())
            .topic(ConsumerTopicConfig::new("orders", true), processor)
            .build();

        assert!(matches!(result, Err(EngineError::DuplicateTopic(t)) if t == "orders"));
    }

    #[test]
    fn test_build_rejects_zero_fetch_size() {
        let result = ConsumerEngine::builder(broker())
            .topic(
                ConsumerTopicConfig::new("orders", false),
                Arc::new(RecordingProcessor::new()),
            )
            .settings(EngineSettings {
                max_fetch_records: 0,
                ..Default::default()
            })
            .build();

        assert!(matches!(result, Err(EngineError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_build_registers_coordinator_for_rebalances() {
        let p0 = Partition::new("orders", 0);
        let broker = Arc::new(MockBrokerClient::new().with_script(vec![
            ScriptStep::Assign(vec![p0.clone()]),
            ScriptStep::Records(make_fetch("orders", 0, ["a", "b"], 0)),
        ]));
        let processor = Arc::new(RecordingProcessor::new());
        let engine = ConsumerEngine::builder(broker.clone())
            .topic(ConsumerTopicConfig::new("orders", true), processor.clone())
            .build()
            .unwrap();

        assert!(!engine.poll_once().await);

        assert_eq!(engine.active_partitions(), vec![p0]);
        assert_eq!(processor.count(), 2);
        engine.close().await.unwrap();
    }
}
