use rdkafka::ClientConfig;

/// rdkafka consumer configuration builder with defaults suited to the engine.
///
/// Offsets are never auto-committed: the engine commits explicitly after a
/// partition's worker has drained (revocation) and on shutdown.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Create a config builder for a group-based consumer.
    ///
    /// Sets: enable.auto.commit=false, socket.timeout.ms, session.timeout.ms,
    /// heartbeat.interval.ms, max.poll.interval.ms.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Override offset reset policy (earliest, latest)
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Set maximum time between poll() calls before consumer leaves group.
    /// Must exceed the worst case of one fetch's processing time, since the
    /// engine does not poll again until every fetched record is processed.
    pub fn with_max_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Enable sticky partition assignments based on the kafka client ID supplied.
    /// When client_id is provided, also enables static membership.
    pub fn with_sticky_partition_assignment(mut self, client_id: Option<&str>) -> Self {
        self.config
            .set("partition.assignment.strategy", "cooperative-sticky");

        if let Some(found_client_id) = client_id {
            self.config.set("client.id", found_client_id);
            self.config.set("group.instance.id", found_client_id);
        }
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// rdkafka producer configuration builder
pub struct ProducerConfigBuilder {
    config: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("statistics.interval.ms", "10000");
        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Maximum time between producer batches during low traffic
    pub fn with_linger_ms(mut self, ms: u32) -> Self {
        self.config.set("linger.ms", ms.to_string());
        self
    }

    /// Time before we stop retrying producing a message
    pub fn with_message_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("message.timeout.ms", ms.to_string());
        self
    }

    /// none, gzip, snappy, lz4, zstd
    pub fn with_compression_codec(mut self, codec: &str) -> Self {
        self.config.set("compression.codec", codec);
        self
    }

    /// Size of the in-memory producer queue
    pub fn with_queue_limits(mut self, mib: u32, messages: u32) -> Self {
        self.config
            .set(
                "queue.buffering.max.kbytes",
                (u64::from(mib) * 1024).to_string(),
            )
            .set("queue.buffering.max.messages", messages.to_string());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults_disable_auto_commit() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "engine").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("engine"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_consumer_sticky_assignment_with_static_membership() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "engine")
            .with_sticky_partition_assignment(Some("engine-0"))
            .with_offset_reset("latest")
            .with_tls(true)
            .build();

        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(config.get("group.instance.id"), Some("engine-0"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_producer_queue_limits() {
        let config = ProducerConfigBuilder::new("localhost:9092")
            .with_queue_limits(400, 10_000_000)
            .with_compression_codec("snappy")
            .build();

        assert_eq!(config.get("queue.buffering.max.kbytes"), Some("409600"));
        assert_eq!(
            config.get("queue.buffering.max.messages"),
            Some("10000000")
        );
        assert_eq!(config.get("compression.codec"), Some("snappy"));
    }

    #[test]
    fn test_producer_queue_limits_do_not_overflow() {
        let config = ProducerConfigBuilder::new("localhost:9092")
            .with_queue_limits(u32::MAX, 1)
            .build();

        assert_eq!(
            config.get("queue.buffering.max.kbytes"),
            Some("4398046510080")
        );
    }

    #[test]
    fn test_consumer_max_poll_interval_override() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "engine")
            .with_max_poll_interval_ms(900_000)
            .build();

        assert_eq!(config.get("max.poll.interval.ms"), Some("900000"));
    }
}
