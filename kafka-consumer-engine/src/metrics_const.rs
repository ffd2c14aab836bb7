// ==== Dispatch metrics ====
/// Counter for records handed to partition workers
pub const RECORDS_DISPATCHED_COUNTER: &str = "engine_records_dispatched_total";

/// Counter for fetched records that were not dispatched, labelled by reason
pub const RECORDS_DROPPED_COUNTER: &str = "engine_records_dropped_total";

/// Counter for fetched records whose partition had no worker, labelled by policy
pub const RECORDS_ORPHANED_COUNTER: &str = "engine_records_orphaned_total";

/// Counter for per-partition fetch errors skipped for the cycle
pub const FETCH_ERRORS_COUNTER: &str = "engine_fetch_errors_total";

/// Histogram for time the poll loop waits for in-flight records to drain
pub const BARRIER_WAIT_DURATION_HISTOGRAM: &str = "engine_barrier_wait_duration_seconds";

/// Gauge for dispatched but not yet processed records
pub const IN_FLIGHT_RECORDS_GAUGE: &str = "engine_in_flight_records";

// ==== Worker metrics ====
/// Counter for processed records, labelled by topic and outcome
pub const RECORDS_PROCESSED_COUNTER: &str = "engine_records_processed_total";

/// Histogram for the duration of a single Process call
pub const RECORD_PROCESSING_DURATION_HISTOGRAM: &str = "engine_record_processing_duration_seconds";

/// Gauge for partition workers currently registered
pub const ACTIVE_WORKERS_GAUGE: &str = "engine_active_workers";

/// Counter for workers abandoned after their stop deadline
pub const WORKERS_ABANDONED_COUNTER: &str = "engine_workers_abandoned_total";

/// Counter for records never attempted because their worker was abandoned
pub const RECORDS_NOT_ATTEMPTED_COUNTER: &str = "engine_records_not_attempted_total";

// ==== Coordinator metrics ====
/// Counter for worker lifecycle changes, labelled by action
pub const WORKER_LIFECYCLE_COUNTER: &str = "engine_worker_lifecycle_total";

/// Counter for offset commits requested by the engine, labelled by trigger and status
pub const ENGINE_COMMITS_COUNTER: &str = "engine_commits_total";

/// Histogram for shutdown duration
pub const SHUTDOWN_DURATION_HISTOGRAM: &str = "engine_shutdown_duration_seconds";
