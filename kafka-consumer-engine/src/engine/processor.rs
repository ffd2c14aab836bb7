use async_trait::async_trait;
use thiserror::Error;

use crate::kafka::message::Message;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The record can never succeed (malformed payload, unknown schema).
    /// Logged at error level and skipped like any other failure.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ProcessError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, ProcessError::Unrecoverable(_))
    }
}

/// Business logic supplied per topic.
///
/// Called concurrently from many partition workers, and in keyed-parallel
/// mode from several tasks of the same worker.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<(), ProcessError>;
}
