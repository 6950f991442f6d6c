//! Logging and metrics setup shared by the replication worker binaries and tests.

pub mod metrics;
pub mod tracing;
