//! In-memory broker client and processors for unit and integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::in_flight::InFlightCounter;
use crate::engine::processor::{ProcessError, Processor};
use crate::kafka::broker::{BrokerClient, BrokerError, DeliveryCallback, Fetch, OutboundRecord};
use crate::kafka::message::{Message, Record};
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::Partition;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build keyed records with consecutive offsets starting at `start_offset`
pub fn make_records<K: AsRef<str>>(
    topic: &str,
    partition: i32,
    keys: impl IntoIterator<Item = K>,
    start_offset: i64,
) -> Vec<Record> {
    keys.into_iter()
        .zip(start_offset..)
        .map(|(key, offset)| {
            Record::new(Partition::new(topic, partition), offset)
                .with_key(key.as_ref())
                .with_value(format!("value-{offset}"))
        })
        .collect()
}

pub fn make_fetch<K: AsRef<str>>(
    topic: &str,
    partition: i32,
    keys: impl IntoIterator<Item = K>,
    start_offset: i64,
) -> Fetch {
    let mut fetch = Fetch::new();
    for record in make_records(topic, partition, keys, start_offset) {
        fetch.push_record(record);
    }
    fetch
}

/// One scripted broker event. Rebalance steps are delivered to the handler
/// at the start of the next fetch, like librdkafka serving callbacks from
/// inside poll.
pub enum ScriptStep {
    Records(Fetch),
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    Lost(Vec<Partition>),
    Error(BrokerError),
}

/// Scripted [`BrokerClient`]. When the script runs out, fetch reports
/// `Closed`, or returns empty fetches if built with `idle_when_exhausted`.
#[derive(Default)]
pub struct MockBrokerClient {
    script: Mutex<VecDeque<ScriptStep>>,
    handler: Mutex<Option<Weak<dyn RebalanceHandler>>>,
    in_flight_monitor: Mutex<Option<Arc<InFlightCounter>>>,
    idle_when_exhausted: bool,
    fail_produce: bool,
    partition_counts: Mutex<HashMap<String, i32>>,
    failing_partition_counts: Mutex<HashSet<String>>,
    produced: Mutex<Vec<OutboundRecord>>,
    closed: AtomicBool,

    fetch_count: AtomicUsize,
    fetch_while_in_flight: AtomicUsize,
    commit_count: AtomicUsize,
    flush_count: AtomicUsize,
    close_count: AtomicUsize,
    allow_rebalance_count: AtomicUsize,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        lock(&self.script).extend(steps);
        self
    }

    pub fn idle_when_exhausted(mut self) -> Self {
        self.idle_when_exhausted = true;
        self
    }

    pub fn with_partition_count(self, topic: &str, count: i32) -> Self {
        lock(&self.partition_counts).insert(topic.to_string(), count);
        self
    }

    pub fn with_failing_produce(mut self) -> Self {
        self.fail_produce = true;
        self
    }

    pub fn push_step(&self, step: ScriptStep) {
        lock(&self.script).push_back(step);
    }

    /// Every fetch checks this counter and records a violation when it is non-zero
    pub fn monitor_in_flight(&self, in_flight: Arc<InFlightCounter>) {
        *lock(&self.in_flight_monitor) = Some(in_flight);
    }

    pub fn fail_partition_count(&self, topic: &str) {
        lock(&self.failing_partition_counts).insert(topic.to_string());
    }

    pub fn produced(&self) -> Vec<OutboundRecord> {
        lock(&self.produced).clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn fetch_while_in_flight(&self) -> usize {
        self.fetch_while_in_flight.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn allow_rebalance_count(&self) -> usize {
        self.allow_rebalance_count.load(Ordering::SeqCst)
    }

    fn handler(&self) -> Option<Arc<dyn RebalanceHandler>> {
        lock(&self.handler).as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    fn register_rebalance_handler(&self, handler: Weak<dyn RebalanceHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    async fn fetch(&self, _max_records: usize) -> Result<Fetch, BrokerError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let busy = lock(&self.in_flight_monitor)
            .as_ref()
            .is_some_and(|monitor| monitor.current() > 0);
        if busy {
            self.fetch_while_in_flight.fetch_add(1, Ordering::SeqCst);
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }

            let step = lock(&self.script).pop_front();
            match step {
                Some(ScriptStep::Records(fetch)) => return Ok(fetch),
                Some(ScriptStep::Error(e)) => return Err(e),
                Some(ScriptStep::Assign(partitions)) => {
                    if let Some(handler) = self.handler() {
                        handler.on_partitions_assigned(&partitions).await;
                    }
                }
                Some(ScriptStep::Revoke(partitions)) => {
                    if let Some(handler) = self.handler() {
                        handler.on_partitions_revoked(&partitions).await;
                    }
                }
                Some(ScriptStep::Lost(partitions)) => {
                    if let Some(handler) = self.handler() {
                        handler.on_partitions_lost(&partitions).await;
                    }
                }
                None if self.idle_when_exhausted => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    return Ok(Fetch::new());
                }
                None => return Err(BrokerError::Closed),
            }
        }
    }

    fn allow_rebalance(&self) {
        self.allow_rebalance_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<i32, BrokerError> {
        if lock(&self.failing_partition_counts).contains(topic) {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        Ok(lock(&self.partition_counts)
            .get(topic)
            .copied()
            .unwrap_or(1))
    }

    fn produce(&self, record: OutboundRecord, on_delivery: DeliveryCallback) {
        lock(&self.produced).push(record);
        if self.fail_produce {
            on_delivery(Err(BrokerError::Fatal("simulated delivery failure".to_string())));
        } else {
            on_delivery(Ok(()));
        }
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records every message it finishes and the peak number of concurrent calls
#[derive(Default)]
pub struct RecordingProcessor {
    delay: Option<Duration>,
    processed: Mutex<Vec<Message>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn count(&self) -> usize {
        lock(&self.processed).len()
    }

    pub fn processed(&self) -> Vec<Message> {
        lock(&self.processed).clone()
    }

    /// Offsets in completion order
    pub fn offsets(&self) -> Vec<i64> {
        lock(&self.processed).iter().map(Message::offset).collect()
    }

    pub fn offsets_for_key(&self, key: &str) -> Vec<i64> {
        lock(&self.processed)
            .iter()
            .filter(|m| m.key() == key.as_bytes())
            .map(Message::offset)
            .collect()
    }

    pub fn offsets_for_partition(&self, topic: &str, partition: i32) -> Vec<i64> {
        lock(&self.processed)
            .iter()
            .filter(|m| m.topic() == topic && m.partition() == partition)
            .map(Message::offset)
            .collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Poll until `n` messages were processed or `timeout` passes
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count() >= n
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, message: &Message) -> Result<(), ProcessError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        lock(&self.processed).push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Error,
    Unrecoverable,
    Panic,
}

/// Fails every message whose key equals `fail_key`, succeeds on the rest
pub struct FailingProcessor {
    mode: FailureMode,
    fail_key: String,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl FailingProcessor {
    pub fn new(mode: FailureMode, fail_key: &str) -> Self {
        Self {
            mode,
            fail_key: fail_key.to_string(),
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for FailingProcessor {
    async fn process(&self, message: &Message) -> Result<(), ProcessError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if message.key() != self.fail_key.as_bytes() {
            return Ok(());
        }

        self.failures.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            FailureMode::Error => Err(ProcessError::Failed(anyhow::anyhow!(
                "simulated failure at offset {}",
                message.offset()
            ))),
            FailureMode::Unrecoverable => Err(ProcessError::Unrecoverable(format!(
                "malformed payload at offset {}",
                message.offset()
            ))),
            FailureMode::Panic => panic!("simulated processor panic"),
        }
    }
}
