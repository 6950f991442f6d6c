//! Queue based table replication worker.
//!
//! Consumes batches of row change events from a tick ordered queue, applies them to a
//! destination and brings newly attached tables in sync through a bulk copy followed by
//! a catch-up phase.

pub mod apply;
pub mod concurrency;
pub mod conversions;
pub mod destination;
pub mod error;
pub mod handlers;
mod macros;
pub mod metrics;
pub mod replication;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod workers;
