use std::collections::HashMap;
use std::future::Future;

use crate::error::ReplicaResult;
use crate::state::table::TableSyncPhase;
use crate::types::{Batch, BatchInfo, BatchWindow, TickId};

/// Synchronization phases of the tables on the provider node, keyed by table name.
pub type ProviderTableStates = HashMap<String, TableSyncPhase>;

/// Trait for pulling batches of events from a queue in tick order.
///
/// A transport is bound to one queue. Every consumer has its own position in the queue
/// which only moves forward on [`QueueTransport::ack`]; a batch that was not acked is
/// delivered again by the next [`QueueTransport::next_batch`] call.
pub trait QueueTransport {
    /// Name of the queue this transport reads from.
    fn queue_name(&self) -> &str;

    /// Returns the next batch of `consumer`, or `None` when no new tick is available.
    ///
    /// A non empty `window` allows the queue to merge several ticks into one batch.
    fn next_batch(
        &self,
        consumer: &str,
        window: &BatchWindow,
    ) -> impl Future<Output = ReplicaResult<Option<Batch>>> + Send;

    /// Closes the batch and moves `consumer` past its tick.
    fn ack(&self, consumer: &str, batch: &BatchInfo) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Registers `consumer` at `at_tick`, or at the latest tick when `None`.
    ///
    /// Registering an existing consumer keeps its position.
    fn register_consumer(
        &self,
        consumer: &str,
        at_tick: Option<TickId>,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn unregister_consumer(&self, consumer: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Returns the table phases of the provider node, or `None` when the queue has no
    /// upstream provider to depend on.
    fn provider_table_states(
        &self,
    ) -> impl Future<Output = ReplicaResult<Option<ProviderTableStates>>> + Send;
}
