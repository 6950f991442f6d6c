use std::fmt;

use crate::types::TickId;

/// Consistency point of a bulk copy.
///
/// The copy reads the source as of the tick it forced when starting, so every event
/// with a tick at or before that point is already part of the copied rows.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CopySnapshot {
    tick_id: TickId,
}

impl CopySnapshot {
    pub fn new(tick_id: TickId) -> Self {
        Self { tick_id }
    }

    pub fn tick_id(&self) -> TickId {
        self.tick_id
    }

    /// Returns `true` if the events of `tick_id` are contained in the copied data.
    pub fn covers(&self, tick_id: TickId) -> bool {
        tick_id <= self.tick_id
    }
}

impl fmt::Display for CopySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick:{}", self.tick_id)
    }
}
