//! Synchronization state of replicated tables.
//!
//! Defines the table phases, the per table record shared by the main and copy workers
//! through the state store and the per pass phase tally.

pub mod counter;
pub mod map;
pub mod snapshot;
pub mod table;
