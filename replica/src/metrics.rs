use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

pub const REPLICA_TABLES_TOTAL: &str = "replica_tables_total";
pub const REPLICA_EVENTS_APPLIED_TOTAL: &str = "replica_events_applied_total";
pub const REPLICA_EVENTS_IGNORED_TOTAL: &str = "replica_events_ignored_total";
pub const REPLICA_BATCH_SIZE: &str = "replica_batch_size";
pub const REPLICA_BATCH_FLUSH_DURATION_SECONDS: &str = "replica_batch_flush_duration_seconds";
pub const REPLICA_COPY_FAILURES_TOTAL: &str = "replica_copy_failures_total";
pub const PHASE_LABEL: &str = "phase";
pub const ROLE_LABEL: &str = "role";

/// Register metrics emitted by the replication worker.
///
/// It is safe to call this method multiple times, the metrics are described only once.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_gauge!(
            REPLICA_TABLES_TOTAL,
            Unit::Count,
            "Number of tables of the queue in each synchronization phase"
        );

        describe_counter!(
            REPLICA_EVENTS_APPLIED_TOTAL,
            Unit::Count,
            "Total number of events applied to the destination"
        );

        describe_counter!(
            REPLICA_EVENTS_IGNORED_TOTAL,
            Unit::Count,
            "Total number of events skipped because they were not interesting to the worker"
        );

        describe_gauge!(
            REPLICA_BATCH_SIZE,
            Unit::Count,
            "Number of events in the last processed batch"
        );

        describe_histogram!(
            REPLICA_BATCH_FLUSH_DURATION_SECONDS,
            Unit::Seconds,
            "Time taken in seconds to flush a buffered batch to the sink"
        );

        describe_counter!(
            REPLICA_COPY_FAILURES_TOTAL,
            Unit::Count,
            "Total number of failed bulk copies"
        );
    });
}
