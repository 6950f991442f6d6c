use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};
use crate::state::table::TableSyncPhase;
use crate::transport::{ProviderTableStates, QueueTransport};
use crate::types::{Batch, BatchId, BatchInfo, BatchWindow, Event, EventId, TickId};

#[derive(Debug)]
struct Consumer {
    last_tick: TickId,
    open_batch: Option<Batch>,
    acked: Vec<TickId>,
}

#[derive(Debug)]
struct Inner {
    /// Closed ticks with their events, ordered by tick.
    ticks: Vec<(TickId, Vec<Event>)>,
    consumers: HashMap<String, Consumer>,
    next_event_id: EventId,
    next_batch_id: BatchId,
    provider_tables: Option<ProviderTableStates>,
}

impl Inner {
    fn latest_tick(&self) -> TickId {
        self.ticks.last().map(|(tick_id, _)| *tick_id).unwrap_or(0)
    }

    fn push_tick(&mut self, events: Vec<Event>) -> TickId {
        let tick_id = self.latest_tick() + 1;
        let events = events
            .into_iter()
            .map(|mut event| {
                event.id = self.next_event_id;
                event.tick_id = tick_id;
                self.next_event_id += 1;
                event
            })
            .collect();

        self.ticks.push((tick_id, events));

        tick_id
    }
}

/// In memory [`QueueTransport`] with producer helpers.
///
/// The queue starts with an empty tick `1`. Events are published per tick with
/// [`MemoryQueue::push_tick`] which assigns event ids and the tick.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    queue_name: Arc<str>,
    idle_ticker: bool,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueue {
    pub fn new(queue_name: &str) -> Self {
        let inner = Inner {
            ticks: vec![(1, Vec::new())],
            consumers: HashMap::new(),
            next_event_id: 1,
            next_batch_id: 1,
            provider_tables: None,
        };

        Self {
            queue_name: Arc::from(queue_name),
            idle_ticker: false,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Makes a poll that found no new tick close an empty one for the next poll, like a
    /// running ticker does.
    pub fn with_idle_ticker(mut self) -> Self {
        self.idle_ticker = true;
        self
    }

    /// Declares the phase of a table on the provider node.
    pub async fn set_provider_table(&self, table: &str, phase: TableSyncPhase) {
        let mut inner = self.inner.lock().await;
        inner
            .provider_tables
            .get_or_insert_with(HashMap::new)
            .insert(table.to_owned(), phase);
    }

    /// Closes a tick containing `events` and returns its id.
    pub async fn push_tick(&self, events: Vec<Event>) -> TickId {
        let mut inner = self.inner.lock().await;
        inner.push_tick(events)
    }

    /// Closes an empty tick, returns its id.
    pub async fn tick(&self) -> TickId {
        self.push_tick(Vec::new()).await
    }

    pub async fn latest_tick(&self) -> TickId {
        let inner = self.inner.lock().await;
        inner.latest_tick()
    }

    /// Returns the ticks acked by `consumer`, in ack order.
    pub async fn acked_ticks(&self, consumer: &str) -> Vec<TickId> {
        let inner = self.inner.lock().await;
        inner
            .consumers
            .get(consumer)
            .map(|consumer| consumer.acked.clone())
            .unwrap_or_default()
    }

    pub async fn consumer_position(&self, consumer: &str) -> Option<TickId> {
        let inner = self.inner.lock().await;
        inner.consumers.get(consumer).map(|c| c.last_tick)
    }

    pub async fn is_registered(&self, consumer: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.consumers.contains_key(consumer)
    }
}

impl QueueTransport for MemoryQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn next_batch(&self, consumer: &str, window: &BatchWindow) -> ReplicaResult<Option<Batch>> {
        let mut inner = self.inner.lock().await;

        let Some(state) = inner.consumers.get(consumer) else {
            bail!(ErrorKind::InvalidState, "Consumer is not registered", consumer);
        };
        if let Some(batch) = &state.open_batch {
            debug!(consumer, batch_id = batch.info.batch_id, "redelivering open batch");
            return Ok(Some(batch.clone()));
        }

        let prev_tick_id = state.last_tick;
        if inner.latest_tick() <= prev_tick_id {
            if self.idle_ticker {
                inner.push_tick(Vec::new());
            }

            return Ok(None);
        }

        let mut tick_id = prev_tick_id;
        let mut events = Vec::new();
        for (id, tick_events) in inner.ticks.iter().filter(|(id, _)| *id > prev_tick_id) {
            tick_id = *id;
            events.extend(tick_events.iter().cloned());

            if window.is_empty() {
                break;
            }
            if let Some(min_count) = window.min_count
                && events.len() as u64 >= min_count
            {
                break;
            }
        }

        let batch_id = inner.next_batch_id;
        inner.next_batch_id += 1;

        let batch = Batch {
            info: BatchInfo {
                batch_id,
                prev_tick_id,
                tick_id,
            },
            events,
        };

        if let Some(state) = inner.consumers.get_mut(consumer) {
            state.open_batch = Some(batch.clone());
        }

        Ok(Some(batch))
    }

    async fn ack(&self, consumer: &str, batch: &BatchInfo) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(state) = inner.consumers.get_mut(consumer) else {
            bail!(ErrorKind::InvalidState, "Consumer is not registered", consumer);
        };

        let is_open = state
            .open_batch
            .as_ref()
            .is_some_and(|open| open.info.batch_id == batch.batch_id);
        if !is_open {
            bail!(
                ErrorKind::InvalidState,
                "Acked batch is not open",
                format!("consumer {consumer}, batch {}", batch.batch_id)
            );
        }

        state.last_tick = batch.tick_id;
        state.open_batch = None;
        state.acked.push(batch.tick_id);

        Ok(())
    }

    async fn register_consumer(&self, consumer: &str, at_tick: Option<TickId>) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        let last_tick = at_tick.unwrap_or_else(|| inner.latest_tick());

        inner
            .consumers
            .entry(consumer.to_owned())
            .or_insert_with(|| Consumer {
                last_tick,
                open_batch: None,
                acked: Vec::new(),
            });

        Ok(())
    }

    async fn unregister_consumer(&self, consumer: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.consumers.remove(consumer);

        Ok(())
    }

    async fn provider_table_states(&self) -> ReplicaResult<Option<ProviderTableStates>> {
        let inner = self.inner.lock().await;

        Ok(inner.provider_tables.clone())
    }
}
