use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("`max_parallel_copies` cannot be zero")]
    MaxParallelCopiesZero,

    #[error("`{0}` cannot be empty")]
    EmptyName(&'static str),

    #[error("`sync_poll_interval_ms` cannot be zero")]
    SyncPollIntervalZero,

    #[error("`retry.backoff_factor` must be at least 1.0, got {0}")]
    InvalidBackoffFactor(f32),

    #[error("the http sink url `{0}` must end with `/`")]
    SinkUrlWithoutTrailingSlash(String),
}
