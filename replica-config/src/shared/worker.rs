use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::shared::{RetryConfig, ValidationError};

fn default_sync_poll_interval_ms() -> u64 {
    3_000
}

fn default_loop_delay_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

/// Settings of one replication worker consuming one queue.
#[derive(Clone, Debug, Deserialize)]
pub struct WorkerConfig {
    /// Name of the queue to consume.
    pub queue_name: String,
    /// Consumer name registered on the queue. Copy workers derive their own name from it.
    pub consumer_name: String,
    /// Maximum number of tables in `IN_COPY` at the same time.
    pub max_parallel_copies: u16,
    /// Sleep between two evaluations of the table states while waiting on another worker.
    #[serde(default = "default_sync_poll_interval_ms")]
    pub sync_poll_interval_ms: u64,
    /// Sleep after an empty poll of the queue.
    #[serde(default = "default_loop_delay_ms")]
    pub loop_delay_ms: u64,
    #[serde(default)]
    pub batch_window: BatchWindowConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Restart copy workers for tables that already finished their bulk copy.
    #[serde(default = "default_true")]
    pub resume_copies_on_start: bool,
}

impl WorkerConfig {
    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    /// Validates the worker settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue_name.is_empty() {
            return Err(ValidationError::EmptyName("queue_name"));
        }

        if self.consumer_name.is_empty() {
            return Err(ValidationError::EmptyName("consumer_name"));
        }

        if self.max_parallel_copies == 0 {
            return Err(ValidationError::MaxParallelCopiesZero);
        }

        if self.sync_poll_interval_ms == 0 {
            return Err(ValidationError::SyncPollIntervalZero);
        }

        self.retry.validate()?;
        self.apply.validate()
    }
}

/// How many ticks the queue may merge into a single batch.
///
/// Both limits unset means one batch per tick.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BatchWindowConfig {
    /// Minimum number of events a batch should contain.
    pub min_count: Option<u64>,
    /// Minimum time span a batch should cover.
    pub min_interval_ms: Option<u64>,
}

/// Where the changes of a batch go.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplyConfig {
    /// Statements run on the destination inside the batch transaction.
    #[default]
    Direct,
    /// Changes are collected and flushed once per batch to a sink.
    Buffered { sink: SinkConfig },
}

impl ApplyConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let ApplyConfig::Buffered {
            sink: SinkConfig::Http { url },
        } = self
            && !url.ends_with('/')
        {
            return Err(ValidationError::SinkUrlWithoutTrailingSlash(url.clone()));
        }

        Ok(())
    }
}

/// Target of a buffered batch flush.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Multipart POST to `{url}sync`.
    Http { url: String },
    /// One JSON file per batch in `dir`.
    File { dir: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_config() -> WorkerConfig {
        serde_json::from_value(serde_json::json!({
            "queue_name": "orders_queue",
            "consumer_name": "leaf_a",
            "max_parallel_copies": 2
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = worker_config();

        assert_eq!(config.sync_poll_interval(), Duration::from_secs(3));
        assert_eq!(config.batch_window, BatchWindowConfig::default());
        assert!(matches!(config.apply, ApplyConfig::Direct));
        assert!(config.resume_copies_on_start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_copies_is_rejected() {
        let mut config = worker_config();
        config.max_parallel_copies = 0;

        assert!(matches!(
            config.validate(),
            Err(ValidationError::MaxParallelCopiesZero)
        ));
    }

    #[test]
    fn buffered_sink_is_parsed() {
        let apply: ApplyConfig = serde_json::from_value(serde_json::json!({
            "type": "buffered",
            "sink": { "type": "http", "url": "http://rest.local/api" }
        }))
        .unwrap();

        assert!(matches!(
            apply.validate(),
            Err(ValidationError::SinkUrlWithoutTrailingSlash(_))
        ));
    }
}
