use tokio::sync::watch;

use crate::metrics_const::IN_FLIGHT_RECORDS_GAUGE;

/// Process-wide count of records dispatched to workers but not yet processed.
///
/// The dispatcher adds a sub-batch's size before enqueueing it and workers
/// complete one record at a time. `wait_for_zero` is the barrier the poll loop
/// blocks on before it may fetch again.
#[derive(Debug)]
pub struct InFlightCounter {
    tx: watch::Sender<usize>,
}

impl InFlightCounter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.tx.send_modify(|count| *count += n);
        self.report();
    }

    /// Mark `n` records as finished. Saturates at zero.
    pub fn complete(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.tx.send_modify(|count| *count = count.saturating_sub(n));
        self.report();
    }

    pub fn current(&self) -> usize {
        *self.tx.borrow()
    }

    pub async fn wait_for_zero(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        drop(rx.wait_for(|count| *count == 0).await);
    }

    fn report(&self) {
        metrics::gauge!(IN_FLIGHT_RECORDS_GAUGE).set(self.current() as f64);
    }
}

impl Default for InFlightCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_for_zero_returns_immediately_when_idle() {
        let counter = InFlightCounter::new();
        tokio::time::timeout(Duration::from_millis(100), counter.wait_for_zero())
            .await
            .expect("idle counter should not block");
    }

    #[tokio::test]
    async fn test_wait_for_zero_blocks_until_drained() {
        let counter = Arc::new(InFlightCounter::new());
        counter.add(3);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_for_zero().await })
        };

        counter.complete(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        counter.complete(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier should release")
            .unwrap();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_complete_saturates() {
        let counter = InFlightCounter::new();
        counter.add(1);
        counter.complete(5);
        assert_eq!(counter.current(), 0);
    }
}
