use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::kafka::metrics_consts::{REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS};
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::partitions_from_list;

/// rdkafka consumer context that forwards group membership changes to the
/// engine's [`RebalanceHandler`].
///
/// librdkafka serves rebalance callbacks from inside the consumer poll, which
/// the engine only issues once every previously fetched record is processed.
/// The callbacks block the polling thread until the handler finishes, so a
/// revoked partition's worker is fully drained (and its offsets committed)
/// before librdkafka completes the revocation.
///
/// Blocking uses `block_in_place`, so the consumer must be polled from a
/// multi-threaded tokio runtime.
pub struct EngineConsumerContext {
    handler: OnceLock<Weak<dyn RebalanceHandler>>,
    rt_handle: Handle,
}

impl EngineConsumerContext {
    pub fn new() -> Self {
        Self {
            handler: OnceLock::new(),
            rt_handle: Handle::current(),
        }
    }

    pub fn register(&self, handler: Weak<dyn RebalanceHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("Rebalance handler already registered, ignoring");
        }
    }

    fn handler(&self) -> Option<Arc<dyn RebalanceHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn block_on<F: Future<Output = ()>>(&self, fut: F) {
        tokio::task::block_in_place(|| self.rt_handle.block_on(fut));
    }

    fn handle_revoke(&self, base_consumer: &BaseConsumer<Self>, list: &TopicPartitionList) {
        // cooperative-sticky sends empty revokes whenever group membership changes
        if list.count() == 0 {
            debug!("Skipping empty revoke rebalance (cooperative-sticky no-op)");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke").increment(1);
            return;
        }

        let Some(handler) = self.handler() else {
            warn!(
                partitions = list.count(),
                "Revoke received with no rebalance handler registered"
            );
            return;
        };

        let partitions = partitions_from_list(list);
        if base_consumer.assignment_lost() {
            warn!(partitions = partitions.len(), "Partitions lost");
            metrics::counter!(REBALANCE_EVENTS, "event_type" => "lost").increment(1);
            self.block_on(handler.on_partitions_lost(&partitions));
        } else {
            info!(partitions = partitions.len(), "Revoking partitions");
            metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
            self.block_on(handler.on_partitions_revoked(&partitions));
        }
    }

    fn handle_assign(&self, list: &TopicPartitionList) {
        if list.count() == 0 {
            debug!("Skipping empty assign rebalance (cooperative-sticky no-op)");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
            return;
        }

        let Some(handler) = self.handler() else {
            warn!(
                partitions = list.count(),
                "Assign received with no rebalance handler registered"
            );
            return;
        };

        let partitions = partitions_from_list(list);
        info!(partitions = partitions.len(), "Assigning partitions");
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
        self.block_on(handler.on_partitions_assigned(&partitions));
    }
}

impl Default for EngineConsumerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientContext for EngineConsumerContext {}

impl ConsumerContext for EngineConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.handle_revoke(base_consumer, partitions),
            Rebalance::Assign(partitions) => {
                debug!(
                    partitions = partitions.count(),
                    "Pre-rebalance assign event"
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => self.handle_assign(partitions),
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!(
                    "Successfully committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}
