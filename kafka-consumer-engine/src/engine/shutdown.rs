use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::coordinator::Coordinator;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::EngineError;
use crate::kafka::broker::BrokerClient;
use crate::metrics_const::{ENGINE_COMMITS_COUNTER, SHUTDOWN_DURATION_HISTOGRAM};

/// What the terminal shutdown sequence achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers_stopped: usize,
    pub workers_abandoned: usize,
    pub records_not_attempted: usize,
    pub commit_ok: bool,
    pub flush_ok: bool,
}

impl ShutdownReport {
    /// Every dispatched record was attempted
    pub fn is_complete(&self) -> bool {
        self.records_not_attempted == 0
    }

    pub fn into_result(self) -> Result<ShutdownReport, EngineError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(EngineError::ShutdownIncomplete {
                not_attempted: self.records_not_attempted,
            })
        }
    }
}

/// Runs the shutdown sequence at most once, no matter how many callers
/// trigger it. Concurrent callers wait for the same run and all receive its
/// report.
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
    broker: Arc<dyn BrokerClient>,
    timeout: Duration,
    done: AtomicBool,
    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(
        cancel: CancellationToken,
        dispatcher: Arc<Dispatcher>,
        coordinator: Arc<Coordinator>,
        broker: Arc<dyn BrokerClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            cancel,
            dispatcher,
            coordinator,
            broker,
            timeout,
            done: AtomicBool::new(false),
            report: OnceCell::new(),
        }
    }

    pub async fn close(&self) -> Result<ShutdownReport, EngineError> {
        self.report
            .get_or_init(|| self.shutdown())
            .await
            .clone()
            .into_result()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> ShutdownReport {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        info!(timeout_secs = self.timeout.as_secs(), "Shutting down consumer engine");

        // 1. no new fetches
        self.cancel.cancel();
        if !self.dispatcher.quiesce(remaining()).await {
            warn!("Poll loop did not finish its cycle before the shutdown deadline");
        }

        // 2. drain every worker
        let summary = self.coordinator.stop_all(remaining()).await;

        // 3. final commit
        let commit_ok = match self.broker.commit().await {
            Ok(()) => {
                metrics::counter!(ENGINE_COMMITS_COUNTER, "trigger" => "shutdown", "status" => "success")
                    .increment(1);
                true
            }
            Err(e) => {
                warn!(error = ?e, "Final offset commit failed");
                metrics::counter!(ENGINE_COMMITS_COUNTER, "trigger" => "shutdown", "status" => "error")
                    .increment(1);
                false
            }
        };

        // 4. flush buffered publishes
        let flush_ok = match self.broker.flush(remaining()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = ?e, "Final producer flush failed");
                false
            }
        };

        self.done.store(true, Ordering::SeqCst);
        self.broker.close();

        let report = ShutdownReport {
            workers_stopped: summary.stopped,
            workers_abandoned: summary.abandoned,
            records_not_attempted: summary.not_attempted,
            commit_ok,
            flush_ok,
        };

        metrics::histogram!(SHUTDOWN_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());
        if report.is_complete() {
            info!(report = ?report, "Consumer engine shut down");
        } else {
            warn!(
                report = ?report,
                "Consumer engine shut down with records not attempted, deadline exhausted"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_into_result() {
        let complete = ShutdownReport {
            workers_stopped: 2,
            commit_ok: true,
            flush_ok: true,
            ..Default::default()
        };
        assert_eq!(complete.clone().into_result().unwrap(), complete);

        let incomplete = ShutdownReport {
            workers_abandoned: 1,
            records_not_attempted: 7,
            ..Default::default()
        };
        match incomplete.into_result() {
            Err(EngineError::ShutdownIncomplete { not_attempted }) => assert_eq!(not_attempted, 7),
            other => panic!("expected ShutdownIncomplete, got {other:?}"),
        }
    }
}
