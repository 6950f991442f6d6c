//! Types shared by the queue, the dispatcher and the apply targets.

mod batch;
mod change;
mod event;

pub use batch::*;
pub use change::*;
pub use event::*;
