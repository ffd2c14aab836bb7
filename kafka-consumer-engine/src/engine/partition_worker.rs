//! Partition Worker - one long-lived task per assigned partition
//!
//! Each worker owns a bounded queue of record batches and drains it with one of
//! two policies:
//! 1. Sequential: every record in fetch order, one at a time
//! 2. Keyed-parallel: one task per distinct key in a batch, per-key order kept
//!
//! A worker only moves forward through `Assigned -> Closing -> Done`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::in_flight::InFlightCounter;
use crate::engine::processor::{ProcessError, Processor};
use crate::kafka::message::{Message, Record};
use crate::kafka::types::Partition;
use crate::metrics_const::{
    RECORDS_NOT_ATTEMPTED_COUNTER, RECORDS_PROCESSED_COUNTER,
    RECORD_PROCESSING_DURATION_HISTOGRAM, WORKERS_ABANDONED_COUNTER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Assigned,
    Closing,
    Done,
}

/// Intra-partition concurrency policy, fixed per topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    Sequential,
    #[default]
    KeyedParallel,
}

impl ConcurrencyMode {
    pub fn from_sequential(sequential: bool) -> Self {
        if sequential {
            ConcurrencyMode::Sequential
        } else {
            ConcurrencyMode::KeyedParallel
        }
    }
}

/// Configuration for partition workers
#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Size of the channel buffer per partition
    pub channel_buffer_size: usize,
    /// Upper bound for a single Process call
    pub record_timeout: Duration,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 10, // Buffer up to 10 batches per partition
            record_timeout: Duration::from_secs(30),
        }
    }
}

/// A batch of records for a single partition
#[derive(Debug)]
pub struct PartitionBatch {
    pub records: Vec<Record>,
    /// Sequential batch ID for ordering verification
    pub batch_id: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("worker queue is closed, {0} records rejected")]
    Closed(usize),
    #[error("worker queue is full, {0} records rejected")]
    Full(usize),
}

impl EnqueueError {
    pub fn rejected(&self) -> usize {
        match self {
            EnqueueError::Closed(n) | EnqueueError::Full(n) => *n,
        }
    }
}

/// Records enqueued to one worker and not yet finished. Mirrors the worker's
/// share of the global in-flight counter so an abandoned worker can release
/// exactly what it still owes.
#[derive(Debug)]
struct PendingRecords {
    count: AtomicUsize,
    in_flight: Arc<InFlightCounter>,
}

impl PendingRecords {
    fn reserve(&self, n: usize) {
        self.count.fetch_add(n, Ordering::SeqCst);
        self.in_flight.add(n);
    }

    fn release(&self, n: usize) {
        let released = self.take(n);
        self.in_flight.complete(released);
    }

    /// Each record is accounted once: after `abandon` late completions are ignored
    fn complete_one(&self) {
        if self.take(1) == 1 {
            self.in_flight.complete(1);
        }
    }

    fn abandon(&self) -> usize {
        let remaining = self.count.swap(0, Ordering::SeqCst);
        self.in_flight.complete(remaining);
        remaining
    }

    fn take(&self, n: usize) -> usize {
        match self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(n))
            }) {
            Ok(previous) | Err(previous) => previous.min(n),
        }
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Everything a worker task needs to process a record. Shared with the
/// per-key tasks in keyed-parallel mode.
struct WorkerContext {
    partition: Partition,
    partition_count: i32,
    processor: Arc<dyn Processor>,
    record_timeout: Duration,
    pending: Arc<PendingRecords>,
    // fired by abandon; no record starts after this
    cancel: CancellationToken,
}

pub struct PartitionWorker {
    partition: Partition,
    mode: ConcurrencyMode,
    sender: Mutex<Option<mpsc::Sender<PartitionBatch>>>,
    state: Arc<watch::Sender<WorkerState>>,
    pending: Arc<PendingRecords>,
    next_batch_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl PartitionWorker {
    /// Spawn the worker task. Requires a tokio runtime.
    pub fn spawn(
        partition: Partition,
        partition_count: i32,
        mode: ConcurrencyMode,
        processor: Arc<dyn Processor>,
        in_flight: Arc<InFlightCounter>,
        config: &PartitionWorkerConfig,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let (state, _) = watch::channel(WorkerState::Assigned);
        let state = Arc::new(state);
        let pending = Arc::new(PendingRecords {
            count: AtomicUsize::new(0),
            in_flight,
        });

        let cancel = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            partition: partition.clone(),
            partition_count,
            processor,
            record_timeout: config.record_timeout,
            pending: pending.clone(),
            cancel: cancel.clone(),
        });

        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let partition = ctx.partition.clone();
            let outcome = AssertUnwindSafe(Self::run_worker(ctx, receiver, mode))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    panic = panic_message(panic.as_ref()),
                    "Partition worker panicked"
                );
            }
            advance(&task_state, WorkerState::Done);
        });

        Arc::new(Self {
            partition,
            mode,
            sender: Mutex::new(Some(sender)),
            state,
            pending,
            next_batch_id: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
            cancel,
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// True once `stop` was requested; such a worker accepts no more records
    pub fn is_closing(&self) -> bool {
        self.state() >= WorkerState::Closing
    }

    pub fn is_done(&self) -> bool {
        self.state() == WorkerState::Done
    }

    /// Records enqueued to this worker that have not finished yet
    pub fn pending(&self) -> usize {
        self.pending.current()
    }

    /// Hand a batch to the worker without blocking.
    ///
    /// The records are added to the in-flight counter before the batch becomes
    /// visible to the worker, and taken back out if the batch is rejected.
    pub fn enqueue(&self, records: Vec<Record>) -> Result<(), EnqueueError> {
        let count = records.len();
        if count == 0 {
            return Ok(());
        }

        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(EnqueueError::Closed(count));
        };

        self.pending.reserve(count);
        let batch = PartitionBatch {
            records,
            batch_id: self.next_batch_id.fetch_add(1, Ordering::SeqCst),
        };

        match sender.try_send(batch) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pending.release(count);
                Err(EnqueueError::Full(count))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.release(count);
                Err(EnqueueError::Closed(count))
            }
        }
    }

    /// Close the input queue and wait for the queued records to drain.
    ///
    /// Only the first call has an effect. Returns whether the worker reached
    /// `Done` within `timeout`; later calls just report the current state.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == WorkerState::Assigned {
                *state = WorkerState::Closing;
                true
            } else {
                false
            }
        });

        if !first {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Stop already requested, ignoring"
            );
            return self.is_done();
        }

        drop(self.take_sender());
        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            pending = self.pending(),
            "Partition worker closing"
        );

        self.wait_done(timeout).await
    }

    /// Wait until the worker reaches `Done`, up to `timeout`
    pub async fn wait_done(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let done = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == WorkerState::Done)).await,
            Ok(Ok(_))
        );
        done
    }

    /// Abort the worker task and release every record it still owes.
    ///
    /// Returns the number of records that were never attempted (or were cut
    /// off mid-call). The worker is `Done` afterwards.
    pub async fn abandon(&self) -> usize {
        // key tasks outlive the aborted worker task until their next poll
        self.cancel.cancel();
        drop(self.take_sender());

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        "Partition worker panicked before abandonment"
                    );
                }
            }
        }

        advance(&self.state, WorkerState::Closing);
        advance(&self.state, WorkerState::Done);

        let not_attempted = self.pending.abandon();
        if not_attempted > 0 {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                records = not_attempted,
                "Records not attempted, deadline exhausted"
            );
            metrics::counter!(RECORDS_NOT_ATTEMPTED_COUNTER, "topic" => self.partition.topic().to_string())
                .increment(not_attempted as u64);
        }
        metrics::counter!(WORKERS_ABANDONED_COUNTER).increment(1);

        not_attempted
    }

    fn take_sender(&self) -> Option<mpsc::Sender<PartitionBatch>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The main worker loop
    async fn run_worker(
        ctx: Arc<WorkerContext>,
        mut receiver: mpsc::Receiver<PartitionBatch>,
        mode: ConcurrencyMode,
    ) {
        info!(
            topic = ctx.partition.topic(),
            partition = ctx.partition.partition_number(),
            mode = ?mode,
            "Starting partition worker"
        );

        while let Some(batch) = receiver.recv().await {
            debug!(
                topic = ctx.partition.topic(),
                partition = ctx.partition.partition_number(),
                batch_id = batch.batch_id,
                records = batch.records.len(),
                first_offset = ?batch.records.first().map(Record::offset),
                last_offset = ?batch.records.last().map(Record::offset),
                "Processing batch"
            );

            match mode {
                ConcurrencyMode::Sequential => {
                    ctx.process_group(batch.records).await;
                }
                ConcurrencyMode::KeyedParallel => {
                    Self::process_keyed(&ctx, batch.records).await;
                }
            }
        }

        info!(
            topic = ctx.partition.topic(),
            partition = ctx.partition.partition_number(),
            "Partition worker drained, shutting down"
        );
    }

    /// One task per distinct key; the batch is finished when every key task is
    async fn process_keyed(ctx: &Arc<WorkerContext>, records: Vec<Record>) {
        let groups = group_by_key(records);

        if groups.len() == 1 {
            for group in groups {
                ctx.process_group(group).await;
            }
            return;
        }

        let mut tasks = JoinSet::new();
        for group in groups {
            let ctx = ctx.clone();
            tasks.spawn(async move { ctx.process_group(group).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(
                    topic = ctx.partition.topic(),
                    partition = ctx.partition.partition_number(),
                    error = ?e,
                    "Key task failed"
                );
            }
        }
    }
}

impl WorkerContext {
    /// Process records in order. Stops before the next record, or mid-call,
    /// once the worker is abandoned; the rest are counted by `abandon`.
    async fn process_group(&self, records: Vec<Record>) {
        for record in records {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.process_record(record) => {}
            }
        }
    }

    async fn process_record(&self, record: Record) {
        let message = Message::from_record(record, self.partition_count);
        let start = Instant::now();

        let outcome = tokio::time::timeout(
            self.record_timeout,
            AssertUnwindSafe(self.processor.process(&message)).catch_unwind(),
        )
        .await;

        let elapsed = start.elapsed();
        let key = String::from_utf8_lossy(message.key());
        let value = String::from_utf8_lossy(message.value());

        let result = match outcome {
            Ok(Ok(Ok(()))) => {
                debug!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    key = %key,
                    value = %value,
                    timestamp = %message.timestamp(),
                    headers = ?message.headers(),
                    "Record processed"
                );
                "success"
            }
            Ok(Ok(Err(ProcessError::Unrecoverable(reason)))) => {
                error!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    key = %key,
                    value = %value,
                    timestamp = %message.timestamp(),
                    headers = ?message.headers(),
                    reason = %reason,
                    "Unrecoverable error processing record, skipping"
                );
                "unrecoverable"
            }
            Ok(Ok(Err(e))) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    key = %key,
                    value = %value,
                    timestamp = %message.timestamp(),
                    headers = ?message.headers(),
                    error = ?e,
                    "Failed to process record"
                );
                "error"
            }
            Ok(Err(panic)) => {
                error!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    key = %key,
                    value = %value,
                    timestamp = %message.timestamp(),
                    headers = ?message.headers(),
                    panic = panic_message(panic.as_ref()),
                    "Processor panicked on record"
                );
                "panic"
            }
            Err(_) => {
                warn!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    key = %key,
                    value = %value,
                    timestamp = %message.timestamp(),
                    headers = ?message.headers(),
                    timeout_ms = self.record_timeout.as_millis() as u64,
                    "Record processing timed out"
                );
                "timeout"
            }
        };

        metrics::counter!(
            RECORDS_PROCESSED_COUNTER,
            "topic" => message.topic().to_string(),
            "outcome" => result
        )
        .increment(1);
        metrics::histogram!(RECORD_PROCESSING_DURATION_HISTOGRAM).record(elapsed.as_secs_f64());

        self.pending.complete_one();
    }
}

/// Split a batch by key, groups in order of first appearance, records in fetch order
fn group_by_key(records: Vec<Record>) -> Vec<Vec<Record>> {
    let mut groups: Vec<Vec<Record>> = Vec::new();
    let mut index: HashMap<Vec<u8>, usize> = HashMap::new();

    for record in records {
        match index.get(record.key_bytes()) {
            Some(&i) => groups[i].push(record),
            None => {
                index.insert(record.key_bytes().to_vec(), groups.len());
                groups.push(vec![record]);
            }
        }
    }

    groups
}

fn advance(state: &watch::Sender<WorkerState>, to: WorkerState) {
    state.send_if_modified(|current| {
        if *current < to {
            *current = to;
            true
        } else {
            false
        }
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
