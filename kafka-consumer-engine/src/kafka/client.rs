use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::kafka::broker::{BrokerClient, BrokerError, DeliveryCallback, Fetch, OutboundRecord};
use crate::kafka::context::EngineConsumerContext;
use crate::kafka::message::Record;
use crate::kafka::metrics_consts::{
    FETCH_BATCH_SIZE, FETCH_DURATION_MS, FETCH_KAFKA_ERROR, OFFSET_COMMITS,
};
use crate::kafka::rebalance_handler::RebalanceHandler;

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// [`BrokerClient`] backed by an rdkafka group consumer and a future producer
/// sharing one set of brokers.
pub struct KafkaBrokerClient {
    consumer: StreamConsumer<EngineConsumerContext>,
    producer: FutureProducer,

    // how long a fetch waits to fill up before returning what it has
    fetch_timeout: Duration,
    metadata_timeout: Duration,

    closed: AtomicBool,
}

impl KafkaBrokerClient {
    pub fn new(
        consumer_config: &ClientConfig,
        producer_config: &ClientConfig,
        topics: &[&str],
        fetch_timeout: Duration,
        metadata_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer<EngineConsumerContext> =
            consumer_config.create_with_context(EngineConsumerContext::new())?;
        consumer.subscribe(topics)?;

        let producer: FutureProducer = producer_config.create()?;

        info!(topics = ?topics, "Subscribed kafka consumer");

        Ok(Self {
            consumer,
            producer,
            fetch_timeout,
            metadata_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Classify a consumer error. Returns the error when it ends consumption.
    fn classify_error(e: KafkaError, fetch: &mut Fetch) -> Option<BrokerError> {
        match e {
            KafkaError::Canceled => {
                info!("Consumer canceled");
                metrics::counter!(FETCH_KAFKA_ERROR, &[("level", "info"), ("error", "canceled")])
                    .increment(1);
                Some(BrokerError::Cancelled)
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                metrics::counter!(FETCH_KAFKA_ERROR, &[("level", "fatal"), ("error", "consumer")])
                    .increment(1);
                Some(BrokerError::Fatal(code.to_string()))
            }
            KafkaError::PartitionEOF(partition) => {
                debug!(partition, "Reached end of partition");
                None
            }
            other => {
                warn!("Kafka consumer error: {other}");
                metrics::counter!(FETCH_KAFKA_ERROR, &[("level", "warn"), ("error", "consumer")])
                    .increment(1);
                fetch.push_error(None, BrokerError::Kafka(other));
                None
            }
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    fn register_rebalance_handler(&self, handler: Weak<dyn RebalanceHandler>) {
        self.consumer.context().register(handler);
    }

    async fn fetch(&self, max_records: usize) -> Result<Fetch, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.fetch_timeout;
        let mut fetch = Fetch::new();

        while fetch.record_count() < max_records {
            let next = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(next) => next,
                Err(_) => break,
            };

            match next {
                Ok(msg) => fetch.push_record(Record::from_borrowed_message(&msg)),
                Err(e) => {
                    if let Some(terminal) = Self::classify_error(e, &mut fetch) {
                        // hand back what was already consumed; the error resurfaces next fetch
                        if fetch.record_count() == 0 {
                            return Err(terminal);
                        }
                        break;
                    }
                    if !fetch.errors.is_empty() {
                        break;
                    }
                }
            }
        }

        if fetch.record_count() == 0 && !fetch.errors.is_empty() {
            sleep(ERROR_BACKOFF).await;
        }

        metrics::histogram!(FETCH_DURATION_MS).record(start.elapsed().as_millis() as f64);
        metrics::histogram!(FETCH_BATCH_SIZE).record(fetch.record_count() as f64);

        Ok(fetch)
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        // synchronous so callers know the offsets are durable before moving on
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {
                metrics::counter!(OFFSET_COMMITS, "status" => "success").increment(1);
                Ok(())
            }
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("No new offsets to commit");
                Ok(())
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMITS, "status" => "error").increment(1);
                Err(e.into())
            }
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<i32, BrokerError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.metadata_timeout)?;

        metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len() as i32)
            .filter(|count| *count > 0)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    fn produce(&self, record: OutboundRecord, on_delivery: DeliveryCallback) {
        let headers = record
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            });

        let future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord {
            topic: &record.topic,
            partition: None,
            payload: record.value.as_deref(),
            key: record.key.as_deref(),
            timestamp: record.timestamp.map(|ts| ts.timestamp_millis()),
            headers: Some(headers),
        };

        match self.producer.send_result(future_record) {
            Ok(delivery) => {
                tokio::spawn(async move {
                    let result = match delivery.await {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err((e, _))) => Err(BrokerError::Kafka(e)),
                        Err(_) => Err(BrokerError::Cancelled),
                    };
                    on_delivery(result);
                });
            }
            Err((e, _)) => on_delivery(Err(BrokerError::Kafka(e))),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer.flush(timeout)?;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consumer.unsubscribe();
        info!("Kafka broker client closed");
    }
}
