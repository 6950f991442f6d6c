//! Worker implementations for one queue.
//!
//! The replication worker replays the queue for tables in sync and launches copy workers.
//! Each copy worker bulk copies one table, replays its backlog and hands it back. The
//! copy worker pool tracks their lifecycle.

pub mod base;
pub mod copy;
pub mod pool;
pub mod replication;
