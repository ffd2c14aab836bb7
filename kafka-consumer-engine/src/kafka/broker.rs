//! Broker client seam.
//!
//! The engine never talks to a broker directly. Everything it needs from the
//! consumer-group protocol (fetching, rebalance callbacks, commits, publishing)
//! goes through [`BrokerClient`]. The production implementation lives in
//! [`crate::kafka::client`]; tests use the in-memory client from
//! [`crate::test_utils`].

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::message::{Record, RecordHeaders};
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::Partition;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker client is closed")]
    Closed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("fatal broker error: {0}")]
    Fatal(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

impl BrokerError {
    /// Terminal errors end the poll loop. Everything else is retried on the next cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BrokerError::Closed | BrokerError::Cancelled | BrokerError::Fatal(_)
        )
    }
}

/// Records fetched for one partition, in broker order
#[derive(Debug, Clone)]
pub struct PartitionRecords {
    pub partition: Partition,
    pub records: Vec<Record>,
}

/// A fetch error scoped to one partition, or to the whole fetch when the
/// client cannot attribute it
#[derive(Debug)]
pub struct PartitionFetchError {
    pub partition: Option<Partition>,
    pub error: BrokerError,
}

/// Result of one fetch: per-partition record batches plus error slots
#[derive(Debug, Default)]
pub struct Fetch {
    pub partitions: Vec<PartitionRecords>,
    pub errors: Vec<PartitionFetchError>,
}

impl Fetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to its partition's batch, keeping fetch order
    pub fn push_record(&mut self, record: Record) {
        match self
            .partitions
            .iter_mut()
            .find(|p| &p.partition == record.partition())
        {
            Some(batch) => batch.records.push(record),
            None => self.partitions.push(PartitionRecords {
                partition: record.partition().clone(),
                records: vec![record],
            }),
        }
    }

    pub fn push_error(&mut self, partition: Option<Partition>, error: BrokerError) {
        self.errors.push(PartitionFetchError { partition, error });
    }

    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(|p| p.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty() && self.errors.is_empty()
    }
}

/// A record handed to the broker client for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: RecordHeaders,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Invoked exactly once when a published record is acknowledged or fails
pub type DeliveryCallback = Box<dyn FnOnce(Result<(), BrokerError>) + Send + 'static>;

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Register the receiver of assign/revoke/lost callbacks. The client keeps
    /// a weak reference so the handler's owner controls its lifetime.
    fn register_rebalance_handler(&self, handler: Weak<dyn RebalanceHandler>);

    /// Fetch up to `max_records` records. Rebalance callbacks are delivered
    /// from inside this call.
    async fn fetch(&self, max_records: usize) -> Result<Fetch, BrokerError>;

    /// Signals that every record from the previous fetch has been processed
    /// and a pending rebalance may proceed.
    fn allow_rebalance(&self) {}

    /// Commit the offsets of everything fetched so far
    async fn commit(&self) -> Result<(), BrokerError>;

    async fn partition_count(&self, topic: &str) -> Result<i32, BrokerError>;

    fn produce(&self, record: OutboundRecord, on_delivery: DeliveryCallback);

    /// Wait for buffered publishes to be delivered
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;

    /// Leave the group and release the connection. Later fetches return `Closed`.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_groups_records_by_partition_in_order() {
        let p0 = Partition::new("orders", 0);
        let p1 = Partition::new("orders", 1);

        let mut fetch = Fetch::new();
        fetch.push_record(Record::new(p0.clone(), 10));
        fetch.push_record(Record::new(p1.clone(), 7));
        fetch.push_record(Record::new(p0.clone(), 11));

        assert_eq!(fetch.record_count(), 3);
        assert_eq!(fetch.partitions.len(), 2);
        assert_eq!(fetch.partitions[0].partition, p0);
        let offsets: Vec<i64> = fetch.partitions[0]
            .records
            .iter()
            .map(|r| r.offset())
            .collect();
        assert_eq!(offsets, vec![10, 11]);
        assert_eq!(fetch.partitions[1].partition, p1);
    }

    #[test]
    fn test_terminal_errors() {
        assert!(BrokerError::Closed.is_terminal());
        assert!(BrokerError::Cancelled.is_terminal());
        assert!(BrokerError::Fatal("fenced".to_string()).is_terminal());
        assert!(!BrokerError::UnknownTopic("orders".to_string()).is_terminal());
    }

    #[test]
    fn test_empty_fetch() {
        let mut fetch = Fetch::new();
        assert!(fetch.is_empty());
        fetch.push_error(None, BrokerError::UnknownTopic("orders".to_string()));
        assert!(!fetch.is_empty());
        assert_eq!(fetch.record_count(), 0);
    }
}
