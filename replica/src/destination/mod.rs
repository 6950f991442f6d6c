//! Destination database abstractions.
//!
//! Provides the [`Destination`] and [`DestinationSession`] traits through which changes,
//! schema statements and foreign key maintenance reach the destination, and an in memory
//! implementation.

mod base;
pub mod memory;

pub use base::{Destination, DestinationSession, ForeignKey, ObjectKind, ReplicationRole};
