//! Batch replay and table synchronization.
//!
//! The apply loop drives both worker roles: it pulls batches, lets the role specific hook
//! advance the table states and applies the events through the dispatcher.

pub mod apply;
pub mod copy;
pub mod dispatch;
pub mod execute;
pub mod sync;
