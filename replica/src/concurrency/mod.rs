//! Shutdown and wake-up signals shared between workers.

pub mod shutdown;
pub mod signal;
