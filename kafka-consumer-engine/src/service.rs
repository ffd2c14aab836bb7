use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{ConsumerEngine, EngineError, Processor, ShutdownReport};
use crate::forwarding_processor::ForwardingProcessor;
use crate::kafka::broker::BrokerClient;
use crate::kafka::client::KafkaBrokerClient;
use crate::producer::Producer;

/// The consumer engine wired to rdkafka and the forwarding processor
pub struct ConsumerService {
    engine: Arc<ConsumerEngine>,
}

impl ConsumerService {
    /// Build the broker client and engine from configuration. Must be called
    /// from within a multi-threaded tokio runtime.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let topics = config.topic_names();
        let client = KafkaBrokerClient::new(
            &config.consumer_config(),
            &config.producer_config(),
            &topics,
            config.fetch_timeout(),
            config.metadata_timeout(),
        )
        .context("Failed to create Kafka client")?;
        let broker: Arc<dyn BrokerClient> = Arc::new(client);

        let processor: Arc<dyn Processor> = match &config.output_topic {
            Some(output_topic) => {
                info!(output_topic = %output_topic, "Forwarding consumed messages");
                Arc::new(ForwardingProcessor::forwarding_to(
                    Producer::new(broker.clone()),
                    output_topic.as_str(),
                ))
            }
            None => Arc::new(ForwardingProcessor::logging_only()),
        };

        Self::with_broker(config, broker, processor)
    }

    /// Build the engine over any broker client, one processor for every topic
    pub fn with_broker(
        config: &Config,
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn Processor>,
    ) -> Result<Self> {
        let builder = config
            .topic_configs()
            .into_iter()
            .fold(ConsumerEngine::builder(broker), |builder, topic| {
                builder.topic(topic, processor.clone())
            });

        let engine = builder
            .settings(config.engine_settings()?)
            .build()
            .context("Failed to build consumer engine")?;

        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &Arc<ConsumerEngine> {
        &self.engine
    }

    /// Run until ctrl+c, then shut down gracefully
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = ?e, "Failed to listen for ctrl+c signal");
            }
        })
        .await
    }

    /// Run with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let engine = self.engine.clone();
        let poll_loop = tokio::spawn(async move { engine.run().await });

        let shutdown_engine = self.engine.clone();
        let signal_task = tokio::spawn(async move {
            shutdown_signal.await;
            info!("Received shutdown signal, shutting down gracefully...");
            // the poll loop's own exit path awaits the same shutdown run
            shutdown_engine.close().await
        });

        let outcome = poll_loop.await.context("poll loop task failed")?;
        signal_task.abort();

        report_outcome(outcome)
    }
}

fn report_outcome(outcome: Result<ShutdownReport, EngineError>) -> Result<()> {
    match outcome {
        Ok(report) => {
            if !report.commit_ok || !report.flush_ok {
                warn!(report = ?report, "Shutdown finished with commit or flush errors");
            }
            info!("Consumer service stopped");
            Ok(())
        }
        Err(e) => Err(e).context("consumer engine did not shut down cleanly"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use envconfig::Envconfig;

    use super::*;
    use crate::kafka::types::Partition;
    use crate::test_utils::{make_fetch, MockBrokerClient, RecordingProcessor, ScriptStep};

    fn config() -> Config {
        let env: HashMap<String, String> = [
            ("KAFKA_CONSUMER_TOPICS", "orders"),
            ("SHUTDOWN_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_with_shutdown_closes_engine_once() {
        let broker = Arc::new(
            MockBrokerClient::new()
                .with_script(vec![
                    ScriptStep::Assign(vec![Partition::new("orders", 0)]),
                    ScriptStep::Records(make_fetch("orders", 0, ["a", "b"], 0)),
                ])
                .idle_when_exhausted(),
        );
        let processor = Arc::new(RecordingProcessor::new());
        let service = ConsumerService::with_broker(&config(), broker.clone(), processor.clone())
            .unwrap();
        let engine = service.engine().clone();

        service
            .run_with_shutdown(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(engine.is_done());
        assert_eq!(processor.count(), 2);
        assert_eq!(broker.close_count(), 1);
        assert_eq!(broker.flush_count(), 1);
    }
}
