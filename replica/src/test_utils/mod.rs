//! Helpers shared by the unit and integration tests of the replication worker.
//!
//! Provides in memory collaborators on top of the memory queue, store and destination,
//! event fixtures and a worker configuration tuned for fast tests.

pub mod config;
pub mod copy;
pub mod event;
pub mod notify;
pub mod sink;
