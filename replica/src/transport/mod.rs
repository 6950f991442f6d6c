//! Access to the ordered, tick numbered event queue.

mod base;
mod memory;

pub use base::*;
pub use memory::*;
