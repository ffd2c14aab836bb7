// Kafka module - broker client seam and the rdkafka adapter behind it
pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod message;
pub mod metrics_consts;
pub mod rebalance_handler;
pub mod types;

// Public API
pub use broker::{BrokerClient, BrokerError, Fetch, OutboundRecord};
pub use client::KafkaBrokerClient;
pub use config::{ConsumerConfigBuilder, ProducerConfigBuilder};
pub use message::{Message, Record};
pub use rebalance_handler::RebalanceHandler;
pub use types::Partition;
