use chrono::{DateTime, Utc};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};

use crate::kafka::types::Partition;

/// Record headers in broker order. Values that are not valid UTF-8 are converted lossily.
pub type RecordHeaders = Vec<(String, String)>;

/// A fetched record as handed over by the broker client, before any
/// engine-side enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: RecordHeaders,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Copy a record out of an rdkafka borrowed message
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| {
                        let value = h
                            .value
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_default();
                        (h.key.to_string(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()),
            headers,
            timestamp: msg
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Grouping key used by keyed-parallel workers. Records without a key share one group.
    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_deref().unwrap_or_default()
    }
}

/// The immutable view of a record that processors receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    key: Vec<u8>,
    value: Vec<u8>,
    headers: RecordHeaders,
    timestamp: DateTime<Utc>,
    topic: String,
    partition: i32,
    partition_count: i32,
    offset: i64,
}

impl Message {
    /// Build a message for publishing. Partition metadata is left unset and
    /// chosen by the broker client's partitioner.
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Vec::new(),
            value: value.into(),
            headers: Vec::new(),
            timestamp: Utc::now(),
            topic: topic.into(),
            partition: -1,
            partition_count: 0,
            offset: -1,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Enrich a fetched record with the topic's partition count. Records
    /// without a broker timestamp are stamped with the current time.
    pub fn from_record(record: Record, partition_count: i32) -> Self {
        Self {
            key: record.key.unwrap_or_default(),
            value: record.value.unwrap_or_default(),
            headers: record.headers,
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
            topic: record.partition.topic().to_string(),
            partition: record.partition.partition_number(),
            partition_count,
            offset: record.offset,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.key)
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn headers(&self) -> &RecordHeaders {
        &self.headers
    }

    /// First header value with the given name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn partition_count(&self) -> i32 {
        self.partition_count
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_from_record() {
        let timestamp = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let record = Record::new(Partition::new("orders", 1), 42)
            .with_key("customer-7")
            .with_value(r#"{"total": 12}"#)
            .with_header("trace-id", "abc")
            .with_header("source", "web")
            .with_timestamp(timestamp);

        let message = Message::from_record(record, 12);

        assert_eq!(message.topic(), "orders");
        assert_eq!(message.partition(), 1);
        assert_eq!(message.partition_count(), 12);
        assert_eq!(message.offset(), 42);
        assert_eq!(message.key_as_str().unwrap(), "customer-7");
        assert_eq!(message.value(), br#"{"total": 12}"#);
        assert_eq!(message.timestamp(), timestamp);
        assert_eq!(message.header("trace-id"), Some("abc"));
        assert_eq!(message.header("missing"), None);
        // header order is preserved
        assert_eq!(message.headers()[0].0, "trace-id");
        assert_eq!(message.headers()[1].0, "source");
    }

    #[test]
    fn test_record_without_key_groups_under_empty_key() {
        let keyless = Record::new(Partition::new("orders", 0), 0);
        let keyed = Record::new(Partition::new("orders", 0), 1).with_key("a");

        assert!(keyless.key_bytes().is_empty());
        assert_eq!(keyed.key_bytes(), b"a");
    }

    #[test]
    fn test_outbound_message_defaults() {
        let message = Message::new("audit", "payload").with_key("k1");

        assert_eq!(message.topic(), "audit");
        assert_eq!(message.key(), b"k1");
        assert_eq!(message.partition(), -1);
        assert!(message.headers().is_empty());
    }
}
