use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::kafka::broker::{BrokerClient, BrokerError, OutboundRecord};
use crate::kafka::message::Message;
use crate::kafka::metrics_consts::PRODUCER_DELIVERIES;

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("delivery failed: {0}")]
    Delivery(#[from] BrokerError),
    #[error("delivery result was dropped before completion")]
    Dropped,
}

/// Fire-and-forget publishing through the engine's broker client
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn BrokerClient>,
}

impl Producer {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self { broker }
    }

    /// Publish a message. The delivery result goes to `response` when given,
    /// otherwise it is logged.
    pub fn send(
        &self,
        message: &Message,
        response: Option<oneshot::Sender<Result<(), BrokerError>>>,
    ) {
        let record = to_outbound(message);
        let topic = record.topic.clone();

        self.broker.produce(
            record,
            Box::new(move |result| {
                let status = if result.is_ok() { "success" } else { "failure" };
                metrics::counter!(PRODUCER_DELIVERIES, "topic" => topic.clone(), "status" => status)
                    .increment(1);

                match response {
                    Some(tx) => {
                        if tx.send(result).is_err() {
                            debug!(topic = %topic, "Delivery receiver dropped before result arrived");
                        }
                    }
                    None => match result {
                        Ok(()) => debug!(topic = %topic, "Message delivered"),
                        Err(e) => error!(topic = %topic, error = ?e, "Failed to deliver message"),
                    },
                }
            }),
        );
    }

    /// Publish a message and wait for the broker's acknowledgement
    pub async fn send_and_wait(&self, message: &Message) -> Result<(), ProduceError> {
        let (tx, rx) = oneshot::channel();
        self.send(message, Some(tx));
        rx.await.map_err(|_| ProduceError::Dropped)??;
        Ok(())
    }
}

fn to_outbound(message: &Message) -> OutboundRecord {
    OutboundRecord {
        topic: message.topic().to_string(),
        key: (!message.key().is_empty()).then(|| message.key().to_vec()),
        value: Some(message.value().to_vec()),
        headers: message.headers().clone(),
        timestamp: Some(message.timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBrokerClient;

    #[tokio::test]
    async fn test_send_forwards_result_to_response_channel() {
        let broker = Arc::new(MockBrokerClient::new());
        let producer = Producer::new(broker.clone());

        let message = Message::new("audit", "payload")
            .with_key("k1")
            .with_header("source", "engine");
        producer.send_and_wait(&message).await.unwrap();

        let produced = broker.produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].topic, "audit");
        assert_eq!(produced[0].key.as_deref(), Some(b"k1".as_slice()));
        assert_eq!(produced[0].headers, vec![("source".to_string(), "engine".to_string())]);
    }

    #[tokio::test]
    async fn test_send_reports_delivery_failure() {
        let broker = Arc::new(MockBrokerClient::new().with_failing_produce());
        let producer = Producer::new(broker);

        let result = producer.send_and_wait(&Message::new("audit", "payload")).await;

        assert!(matches!(result, Err(ProduceError::Delivery(_))));
    }

    #[tokio::test]
    async fn test_send_without_response_channel_logs() {
        let broker = Arc::new(MockBrokerClient::new());
        let producer = Producer::new(broker.clone());

        producer.send(&Message::new("audit", "payload"), None);

        let produced = broker.produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].key, None);
    }
}
