use std::sync::Arc;

use replica_config::shared::{ApplyConfig, BatchWindowConfig, RetryConfig, WorkerConfig};

pub const TEST_QUEUE: &str = "replika";
pub const TEST_CONSUMER: &str = "leaf";

/// Worker configuration with short sleeps and quick retries.
pub fn test_worker_config(max_parallel_copies: u16) -> WorkerConfig {
    WorkerConfig {
        queue_name: TEST_QUEUE.to_owned(),
        consumer_name: TEST_CONSUMER.to_owned(),
        max_parallel_copies,
        sync_poll_interval_ms: 10,
        loop_delay_ms: 5,
        batch_window: BatchWindowConfig::default(),
        apply: ApplyConfig::Direct,
        retry: RetryConfig {
            max_attempts: Some(5),
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_factor: 2.0,
        },
        resume_copies_on_start: true,
    }
}

pub fn shared_test_config(max_parallel_copies: u16) -> Arc<WorkerConfig> {
    Arc::new(test_worker_config(max_parallel_copies))
}
