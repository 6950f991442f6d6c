mod base;
mod connection;
mod replicator;
mod retry;
mod worker;

pub use base::*;
pub use connection::*;
pub use replicator::*;
pub use retry::*;
pub use worker::*;
