//! Durable bookkeeping of the replication worker.
//!
//! The [`state`] store keeps one synchronization record per table of a queue together with
//! the registry of executed schema changes and the queue's global table and sequence sets.

pub mod state;
