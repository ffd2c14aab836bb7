// ==== Rebalance metrics ====
/// Counter for rebalance callbacks forwarded to the engine, labelled by event_type
pub const REBALANCE_EVENTS: &str = "kafka_rebalance_events_total";

/// Counter for empty cooperative-sticky rebalances that were skipped
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_rebalance_empty_skipped_total";

// ==== Fetch metrics ====
/// Histogram for the number of records returned by a single fetch
pub const FETCH_BATCH_SIZE: &str = "kafka_fetch_batch_size";

/// Histogram for time spent collecting a fetch
pub const FETCH_DURATION_MS: &str = "kafka_fetch_duration_ms";

/// Counter for consumer errors seen while fetching, labelled by level and error
pub const FETCH_KAFKA_ERROR: &str = "kafka_fetch_error_total";

// ==== Offset commit metrics ====
/// Counter for offset commits, labelled by status
pub const OFFSET_COMMITS: &str = "kafka_offset_commits_total";

// ==== Producer metrics ====
/// Counter for publish deliveries, labelled by status
pub const PRODUCER_DELIVERIES: &str = "kafka_producer_deliveries_total";
