use std::time::Duration;

use replica_config::shared::BatchWindowConfig;

use crate::types::{BatchId, Event, TickId};

/// Position of a batch in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub batch_id: BatchId,
    /// Last tick already consumed before this batch.
    pub prev_tick_id: TickId,
    /// Tick closing this batch.
    pub tick_id: TickId,
}

impl BatchInfo {
    /// Returns `true` when the batch spans more than one tick.
    pub fn spans_multiple_ticks(&self) -> bool {
        self.tick_id - self.prev_tick_id > 1
    }
}

/// Events between two ticks, applied all or nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub info: BatchInfo,
    pub events: Vec<Event>,
}

/// How many ticks the queue may merge into one batch.
///
/// An empty window asks for exactly one tick per batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWindow {
    pub min_count: Option<u64>,
    pub min_interval: Option<Duration>,
}

impl BatchWindow {
    pub fn is_empty(&self) -> bool {
        self.min_count.is_none() && self.min_interval.is_none()
    }
}

impl From<&BatchWindowConfig> for BatchWindow {
    fn from(config: &BatchWindowConfig) -> Self {
        Self {
            min_count: config.min_count,
            min_interval: config.min_interval_ms.map(Duration::from_millis),
        }
    }
}
