use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::partition_worker::{ConcurrencyMode, PartitionWorker};
use crate::engine::processor::Processor;
use crate::kafka::types::Partition;
use crate::metrics_const::ACTIVE_WORKERS_GAUGE;

/// Static per-topic consumption settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTopicConfig {
    pub topic_name: String,
    /// Process every record of a partition strictly one at a time
    pub sequential: bool,
}

impl ConsumerTopicConfig {
    pub fn new(topic_name: impl Into<String>, sequential: bool) -> Self {
        Self {
            topic_name: topic_name.into(),
            sequential,
        }
    }

    pub fn mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::from_sequential(self.sequential)
    }
}

#[derive(Clone)]
pub struct TopicBinding {
    pub config: ConsumerTopicConfig,
    pub processor: Arc<dyn Processor>,
}

/// Live partition workers and per-topic metadata.
///
/// Lookups are lock-free (sharded DashMap) so the dispatcher never contends
/// with the coordinator. Structural changes are made only by the coordinator
/// while it holds its own lock.
pub struct WorkerRegistry {
    workers: DashMap<Partition, Arc<PartitionWorker>>,
    partition_counts: DashMap<String, i32>,
    topics: HashMap<String, TopicBinding>,
}

impl WorkerRegistry {
    pub fn new(bindings: impl IntoIterator<Item = TopicBinding>) -> Self {
        let topics = bindings
            .into_iter()
            .map(|binding| (binding.config.topic_name.clone(), binding))
            .collect();

        Self {
            workers: DashMap::new(),
            partition_counts: DashMap::new(),
            topics,
        }
    }

    /// Clone the worker out so no DashMap guard is held by the caller
    pub fn get(&self, partition: &Partition) -> Option<Arc<PartitionWorker>> {
        self.workers.get(partition).map(|w| w.value().clone())
    }

    pub fn insert(&self, worker: Arc<PartitionWorker>) -> Option<Arc<PartitionWorker>> {
        let previous = self.workers.insert(worker.partition().clone(), worker);
        self.report();
        previous
    }

    /// Remove the entry only if it still holds this exact worker, so a
    /// replacement installed meanwhile is left alone
    pub fn remove_worker(&self, worker: &Arc<PartitionWorker>) -> bool {
        let removed = self
            .workers
            .remove_if(worker.partition(), |_, current| Arc::ptr_eq(current, worker))
            .is_some();
        self.report();
        removed
    }

    pub fn workers(&self) -> Vec<Arc<PartitionWorker>> {
        self.workers.iter().map(|w| w.value().clone()).collect()
    }

    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.workers.iter().map(|w| w.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn binding(&self, topic: &str) -> Option<&TopicBinding> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.partition_counts.get(topic).map(|c| *c)
    }

    pub fn set_partition_count(&self, topic: &str, count: i32) {
        self.partition_counts.insert(topic.to_string(), count);
    }

    fn report(&self) {
        metrics::gauge!(ACTIVE_WORKERS_GAUGE).set(self.workers.len() as f64);
    }
}
