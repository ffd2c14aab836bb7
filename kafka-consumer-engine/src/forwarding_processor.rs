use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::engine::processor::{ProcessError, Processor};
use crate::kafka::message::Message;
use crate::producer::Producer;

/// Processor used by the service binary: logs every message and optionally
/// republishes it, unchanged, to an output topic.
pub struct ForwardingProcessor {
    output: Option<(Producer, String)>,
}

impl ForwardingProcessor {
    pub fn logging_only() -> Self {
        Self { output: None }
    }

    pub fn forwarding_to(producer: Producer, output_topic: impl Into<String>) -> Self {
        Self {
            output: Some((producer, output_topic.into())),
        }
    }
}

#[async_trait]
impl Processor for ForwardingProcessor {
    async fn process(&self, message: &Message) -> Result<(), ProcessError> {
        info!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            bytes = message.value().len(),
            "Consumed message"
        );

        let Some((producer, output_topic)) = &self.output else {
            return Ok(());
        };

        let forwarded = message
            .headers()
            .iter()
            .fold(
                Message::new(output_topic.as_str(), message.value())
                    .with_key(message.key())
                    .with_timestamp(message.timestamp()),
                |forwarded, (name, value)| forwarded.with_header(name.as_str(), value.as_str()),
            );

        producer
            .send_and_wait(&forwarded)
            .await
            .with_context(|| format!("failed to forward message to {output_topic}"))?;

        Ok(())
    }
}
