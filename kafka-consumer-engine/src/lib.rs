//! Concurrent partitioned Kafka consumer engine.
//!
//! ## Error logging (anyhow)
//!
//! When logging errors with a cause chain, use formats that include the full chain so root
//! causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` gives the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` gives the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors that wrap other errors.

pub mod config;
pub mod engine;
pub mod forwarding_processor;
pub mod kafka;
pub mod metrics_const;
pub mod metrics_server;
pub mod producer;
pub mod service;
pub mod test_utils;

// Re-export commonly used types for convenience
pub use engine::{
    ConsumerEngine, ConsumerTopicConfig, EngineError, EngineSettings, OrphanPolicy, ProcessError,
    Processor, ShutdownReport,
};
pub use kafka::{BrokerClient, BrokerError, Message};
pub use producer::{ProduceError, Producer};
