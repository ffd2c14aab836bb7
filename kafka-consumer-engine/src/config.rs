use std::time::Duration;

use anyhow::{bail, Result};
use envconfig::Envconfig;

use crate::engine::{ConsumerTopicConfig, EngineSettings, OrphanPolicy};
use crate::kafka::config::{ConsumerConfigBuilder, ProducerConfigBuilder};

/// librdkafka default and upper bound for max.poll.interval.ms
const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 300_000;
const MAX_POLL_INTERVAL_LIMIT_MS: u64 = 86_400_000;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-consumer-engine")]
    pub kafka_consumer_group: String,

    // Comma separated
    #[envconfig(default = "events")]
    pub kafka_consumer_topics: String,

    // Comma separated subset of the consumed topics processed strictly in order
    #[envconfig(default = "")]
    pub kafka_sequential_topics: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Enables static group membership with cooperative-sticky assignment
    pub kafka_client_id: Option<String>,

    // The next poll waits for the whole fetch to finish. Derived from
    // MAX_FETCH_RECORDS * RECORD_TIMEOUT_MS when unset.
    pub kafka_max_poll_interval_ms: Option<u64>,

    // Kafka Producer configuration
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String,

    // Republish every consumed message here (optional - if not set, messages are only logged)
    pub output_topic: Option<String>,

    // Engine configuration
    #[envconfig(default = "500")]
    pub max_fetch_records: usize,

    #[envconfig(default = "1000")]
    pub fetch_timeout_ms: u64,

    #[envconfig(default = "5000")]
    pub metadata_timeout_ms: u64,

    #[envconfig(default = "30000")]
    pub record_timeout_ms: u64,

    #[envconfig(default = "30")]
    pub worker_stop_timeout_secs: u64,

    #[envconfig(default = "60")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(default = "10")]
    pub worker_channel_buffer_size: usize,

    // drop | self_heal
    #[envconfig(default = "drop")]
    pub orphan_policy: String,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // Emit logs as JSON lines
    #[envconfig(default = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let topics = self.topic_names();
        if topics.is_empty() {
            bail!("KAFKA_CONSUMER_TOPICS must name at least one topic");
        }

        for sequential in split_list(&self.kafka_sequential_topics) {
            if !topics.contains(&sequential) {
                bail!("sequential topic '{sequential}' is not in KAFKA_CONSUMER_TOPICS");
            }
        }

        if self.max_fetch_records == 0 {
            bail!("MAX_FETCH_RECORDS must be greater than zero");
        }
        if self.record_timeout_ms == 0 {
            bail!("RECORD_TIMEOUT_MS must be greater than zero");
        }
        if self.worker_channel_buffer_size == 0 {
            bail!("WORKER_CHANNEL_BUFFER_SIZE must be greater than zero");
        }
        if self.shutdown_timeout_secs == 0 {
            bail!("SHUTDOWN_TIMEOUT_SECS must be greater than zero");
        }

        let worst_case = self.worst_case_cycle_ms();
        if worst_case > MAX_POLL_INTERVAL_LIMIT_MS {
            bail!(
                "MAX_FETCH_RECORDS * RECORD_TIMEOUT_MS ({worst_case}ms) exceeds the \
                 {MAX_POLL_INTERVAL_LIMIT_MS}ms max poll interval limit"
            );
        }
        if let Some(configured) = self.kafka_max_poll_interval_ms {
            if configured < worst_case {
                bail!(
                    "KAFKA_MAX_POLL_INTERVAL_MS ({configured}) is shorter than one worst-case \
                     fetch cycle ({worst_case}ms), the consumer would be evicted from the group"
                );
            }
            if configured > MAX_POLL_INTERVAL_LIMIT_MS {
                bail!("KAFKA_MAX_POLL_INTERVAL_MS must be at most {MAX_POLL_INTERVAL_LIMIT_MS}");
            }
        }

        self.parsed_orphan_policy()?;
        Ok(())
    }

    /// Longest a single fetch cycle can take: every record in the fetch runs
    /// to its timeout, one after another
    pub fn worst_case_cycle_ms(&self) -> u64 {
        (self.max_fetch_records as u64)
            .saturating_mul(self.record_timeout_ms)
            .saturating_add(self.fetch_timeout_ms)
    }

    pub fn max_poll_interval_ms(&self) -> u64 {
        self.kafka_max_poll_interval_ms
            .unwrap_or_else(|| self.worst_case_cycle_ms().max(DEFAULT_MAX_POLL_INTERVAL_MS))
            .min(MAX_POLL_INTERVAL_LIMIT_MS)
    }

    pub fn topic_names(&self) -> Vec<&str> {
        split_list(&self.kafka_consumer_topics)
    }

    pub fn topic_configs(&self) -> Vec<ConsumerTopicConfig> {
        let sequential = split_list(&self.kafka_sequential_topics);
        self.topic_names()
            .into_iter()
            .map(|topic| ConsumerTopicConfig::new(topic, sequential.contains(&topic)))
            .collect()
    }

    pub fn parsed_orphan_policy(&self) -> Result<OrphanPolicy> {
        self.orphan_policy
            .parse::<OrphanPolicy>()
            .map_err(anyhow::Error::msg)
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            max_fetch_records: self.max_fetch_records,
            record_timeout: Duration::from_millis(self.record_timeout_ms),
            worker_stop_timeout: Duration::from_secs(self.worker_stop_timeout_secs),
            shutdown_timeout: self.shutdown_timeout(),
            channel_buffer_size: self.worker_channel_buffer_size,
            orphan_policy: self.parsed_orphan_policy()?,
        })
    }

    pub fn consumer_config(&self) -> rdkafka::ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_sticky_partition_assignment(self.kafka_client_id.as_deref())
            .with_max_poll_interval_ms(self.max_poll_interval_ms())
            .build()
    }

    pub fn producer_config(&self) -> rdkafka::ClientConfig {
        ProducerConfigBuilder::new(&self.kafka_hosts)
            .with_tls(self.kafka_tls)
            .with_linger_ms(self.kafka_producer_linger_ms)
            .with_queue_limits(
                self.kafka_producer_queue_mib,
                self.kafka_producer_queue_messages,
            )
            .with_message_timeout_ms(self.kafka_message_timeout_ms)
            .with_compression_codec(&self.kafka_compression_codec)
            .build()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert!(config.validate().is_ok());
        assert_eq!(config.topic_names(), vec!["events"]);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.output_topic, None);

        let settings = config.engine_settings().unwrap();
        assert_eq!(settings.max_fetch_records, 500);
        assert_eq!(settings.orphan_policy, OrphanPolicy::Drop);
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_topic_configs_mark_sequential_topics() {
        let config = config_from(&[
            ("KAFKA_CONSUMER_TOPICS", "orders, payments ,audit"),
            ("KAFKA_SEQUENTIAL_TOPICS", "payments"),
        ]);

        assert_eq!(
            config.topic_configs(),
            vec![
                ConsumerTopicConfig::new("orders", false),
                ConsumerTopicConfig::new("payments", true),
                ConsumerTopicConfig::new("audit", false),
            ]
        );
    }

    #[test_case("KAFKA_CONSUMER_TOPICS", " , " ; "empty topic list")]
    #[test_case("MAX_FETCH_RECORDS", "0" ; "zero fetch size")]
    #[test_case("RECORD_TIMEOUT_MS", "0" ; "zero record timeout")]
    #[test_case("WORKER_CHANNEL_BUFFER_SIZE", "0" ; "zero channel buffer")]
    #[test_case("ORPHAN_POLICY", "retry" ; "unknown orphan policy")]
    #[test_case("KAFKA_SEQUENTIAL_TOPICS", "unknown" ; "sequential topic not consumed")]
    #[test_case("KAFKA_MAX_POLL_INTERVAL_MS", "300000" ; "poll interval shorter than a fetch cycle")]
    #[test_case("RECORD_TIMEOUT_MS", "300000" ; "fetch cycle beyond poll interval limit")]
    fn test_validate_rejects(var: &str, value: &str) {
        let config = config_from(&[(var, value)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_heal_policy() {
        let config = config_from(&[("ORPHAN_POLICY", "self_heal")]);
        assert_eq!(
            config.engine_settings().unwrap().orphan_policy,
            OrphanPolicy::SelfHeal
        );
    }

    #[test]
    fn test_consumer_config_uses_static_membership_when_client_id_set() {
        let config = config_from(&[("KAFKA_CLIENT_ID", "engine-1"), ("KAFKA_TLS", "true")]);
        let client_config = config.consumer_config();

        assert_eq!(client_config.get("group.instance.id"), Some("engine-1"));
        assert_eq!(client_config.get("security.protocol"), Some("ssl"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_max_poll_interval_covers_worst_case_cycle() {
        let config = config_from(&[]);
        assert_eq!(config.worst_case_cycle_ms(), 15_001_000);
        assert_eq!(
            config.consumer_config().get("max.poll.interval.ms"),
            Some("15001000")
        );

        let small = config_from(&[("MAX_FETCH_RECORDS", "10"), ("RECORD_TIMEOUT_MS", "1000")]);
        assert_eq!(small.max_poll_interval_ms(), 300_000);

        let explicit = config_from(&[("KAFKA_MAX_POLL_INTERVAL_MS", "20000000")]);
        assert!(explicit.validate().is_ok());
        assert_eq!(
            explicit.consumer_config().get("max.poll.interval.ms"),
            Some("20000000")
        );
    }
}
