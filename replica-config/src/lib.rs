//! Configuration management for the replication worker.
//!
//! Provides environment detection, configuration loading from YAML files,
//! secret handling, and the shared configuration types used by the worker
//! and its Postgres collaborators.

mod environment;
mod load;
pub mod shared;

pub use environment::*;
pub use load::*;
