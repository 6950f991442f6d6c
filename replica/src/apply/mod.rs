//! Apply targets receiving the changes of a batch.
//!
//! [`DirectApply`] executes every change right away inside the destination transaction.
//! [`BufferedApply`] collects the whole batch into one payload that is flushed to a
//! [`BatchSink`] with a single call at the end of the batch.

mod buffered;
mod sink;

use std::future::Future;

use replica_config::shared::{ApplyConfig, SinkConfig};

pub use buffered::{BatchHeader, BatchPayload, Block, BufferedApply};
pub use sink::{BatchSink, FileBatchSink, HttpBatchSink};

use crate::destination::DestinationSession;
use crate::error::ReplicaResult;
use crate::types::{BatchInfo, RowChange};

/// Where the changes of a batch go.
///
/// Targets are exclusive per batch: [`ApplyTarget::begin_batch`] starts a new batch and
/// drops whatever a failed previous attempt left behind.
pub trait ApplyTarget: Clone + Send + Sync + 'static {
    /// Starts a batch of `consumer`.
    fn begin_batch(
        &mut self,
        consumer: &str,
        batch: &BatchInfo,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn apply<S>(
        &mut self,
        session: &mut S,
        change: RowChange,
    ) -> impl Future<Output = ReplicaResult<()>> + Send
    where
        S: DestinationSession + Send;

    /// Ends the batch. Runs before the destination transaction commits.
    fn flush_batch<S>(&mut self, session: &mut S) -> impl Future<Output = ReplicaResult<()>> + Send
    where
        S: DestinationSession + Send;
}

/// Applies each change through the destination session.
#[derive(Debug, Clone, Default)]
pub struct DirectApply;

impl ApplyTarget for DirectApply {
    async fn begin_batch(&mut self, _consumer: &str, _batch: &BatchInfo) -> ReplicaResult<()> {
        Ok(())
    }

    async fn apply<S>(&mut self, session: &mut S, change: RowChange) -> ReplicaResult<()>
    where
        S: DestinationSession + Send,
    {
        session.apply_change(&change).await
    }

    async fn flush_batch<S>(&mut self, _session: &mut S) -> ReplicaResult<()>
    where
        S: DestinationSession + Send,
    {
        Ok(())
    }
}

/// The apply target selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredApply {
    Direct(DirectApply),
    Http(BufferedApply<HttpBatchSink>),
    File(BufferedApply<FileBatchSink>),
}

impl ConfiguredApply {
    pub fn from_config(queue_name: &str, config: &ApplyConfig) -> ReplicaResult<Self> {
        let apply = match config {
            ApplyConfig::Direct => ConfiguredApply::Direct(DirectApply),
            ApplyConfig::Buffered {
                sink: SinkConfig::Http { url },
            } => ConfiguredApply::Http(BufferedApply::new(queue_name, HttpBatchSink::new(url)?)),
            ApplyConfig::Buffered {
                sink: SinkConfig::File { dir },
            } => ConfiguredApply::File(BufferedApply::new(
                queue_name,
                FileBatchSink::new(dir.clone()),
            )),
        };

        Ok(apply)
    }
}

impl ApplyTarget for ConfiguredApply {
    async fn begin_batch(&mut self, consumer: &str, batch: &BatchInfo) -> ReplicaResult<()> {
        match self {
            ConfiguredApply::Direct(target) => target.begin_batch(consumer, batch).await,
            ConfiguredApply::Http(target) => target.begin_batch(consumer, batch).await,
            ConfiguredApply::File(target) => target.begin_batch(consumer, batch).await,
        }
    }

    async fn apply<S>(&mut self, session: &mut S, change: RowChange) -> ReplicaResult<()>
    where
        S: DestinationSession + Send,
    {
        match self {
            ConfiguredApply::Direct(target) => target.apply(session, change).await,
            ConfiguredApply::Http(target) => target.apply(session, change).await,
            ConfiguredApply::File(target) => target.apply(session, change).await,
        }
    }

    async fn flush_batch<S>(&mut self, session: &mut S) -> ReplicaResult<()>
    where
        S: DestinationSession + Send,
    {
        match self {
            ConfiguredApply::Direct(target) => target.flush_batch(session).await,
            ConfiguredApply::Http(target) => target.flush_batch(session).await,
            ConfiguredApply::File(target) => target.flush_batch(session).await,
        }
    }
}
