use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::Serialize;
use tracing::{error, info};

use crate::apply::{ApplyTarget, BatchSink};
use crate::destination::DestinationSession;
use crate::error::ReplicaResult;
use crate::metrics::REPLICA_BATCH_FLUSH_DURATION_SECONDS;
use crate::types::{BatchInfo, ChangeOp, EventId, RowChange, TickId};

/// Identity of a flushed batch, repeated unchanged when a batch is flushed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchHeader {
    pub queue: String,
    /// Queue consumer that processed the batch.
    pub consumer: String,
    pub prev_tick_id: TickId,
    pub tick_id: TickId,
    /// Idempotency key of the batch, `{queue}:{consumer}:{tick_id}`.
    pub key: String,
}

/// One change in the structured block format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub table: String,
    pub op: ChangeOp,
    /// Column names, primary key columns first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<Vec<String>>,
    /// Number of primary key columns, when there is more than one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Option<String>>>>,
    pub ev_id: EventId,
}

impl From<RowChange> for Block {
    fn from(change: RowChange) -> Self {
        if change.op == ChangeOp::Replace {
            return Block {
                table: change.table,
                op: change.op,
                header: None,
                pks: None,
                rows: None,
                ev_id: change.event_id,
            };
        }

        let mut header = change.pkey_columns.clone();
        header.extend(
            change
                .row
                .keys()
                .filter(|column| !change.pkey_columns.contains(column))
                .cloned(),
        );
        let row = header
            .iter()
            .map(|column| change.row.get(column).cloned().flatten())
            .collect();
        let pks = (change.pkey_columns.len() > 1).then_some(change.pkey_columns.len());

        Block {
            table: change.table,
            op: change.op,
            header: Some(header),
            pks,
            rows: Some(vec![row]),
            ev_id: change.event_id,
        }
    }
}

/// Everything a batch applied, sent to the sink in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchPayload {
    pub batch: BatchHeader,
    pub blocks: Vec<Block>,
}

/// Collects the changes of a batch and flushes them once to a [`BatchSink`].
///
/// A failed flush fails the batch, which is then rolled back and retried as a whole. The
/// sink may have ingested part of the payload before failing; the batch key and the event
/// ids let it deduplicate.
#[derive(Debug, Clone)]
pub struct BufferedApply<K> {
    queue_name: Arc<str>,
    sink: K,
    payload: Option<BatchPayload>,
}

impl<K> BufferedApply<K> {
    pub fn new(queue_name: &str, sink: K) -> Self {
        Self {
            queue_name: Arc::from(queue_name),
            sink,
            payload: None,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }
}

impl<K> ApplyTarget for BufferedApply<K>
where
    K: BatchSink,
{
    async fn begin_batch(&mut self, consumer: &str, batch: &BatchInfo) -> ReplicaResult<()> {
        self.payload = Some(BatchPayload {
            batch: BatchHeader {
                queue: self.queue_name.to_string(),
                consumer: consumer.to_owned(),
                prev_tick_id: batch.prev_tick_id,
                tick_id: batch.tick_id,
                key: format!("{}:{consumer}:{}", self.queue_name, batch.tick_id),
            },
            blocks: Vec::new(),
        });

        Ok(())
    }

    async fn apply<S>(&mut self, _session: &mut S, change: RowChange) -> ReplicaResult<()>
    where
        S: DestinationSession + Send,
    {
        if let Some(payload) = self.payload.as_mut() {
            payload.blocks.push(change.into());
        }

        Ok(())
    }

    async fn flush_batch<S>(&mut self, _session: &mut S) -> ReplicaResult<()>
    where
        S: DestinationSession + Send,
    {
        let Some(payload) = self.payload.take() else {
            return Ok(());
        };
        if payload.blocks.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(&payload)?;
        let before_flush = Instant::now();

        if let Err(err) = self.sink.flush(&payload.batch.key, body).await {
            error!(
                key = %payload.batch.key,
                blocks = payload.blocks.len(),
                manual_intervention = true,
                "flushing buffered batch failed, the sink may hold a partial batch: {err}"
            );

            return Err(err);
        }

        histogram!(REPLICA_BATCH_FLUSH_DURATION_SECONDS).record(before_flush.elapsed().as_secs_f64());
        info!(key = %payload.batch.key, blocks = payload.blocks.len(), "flushed buffered batch");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowData;

    fn change(op: ChangeOp, pkeys: &[&str], row: &[(&str, Option<&str>)]) -> RowChange {
        RowChange {
            event_id: 9,
            table: "public.orders".to_owned(),
            op,
            pkey_columns: pkeys.iter().map(|k| k.to_string()).collect(),
            row: row
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_owned)))
                .collect::<RowData>(),
        }
    }

    #[test]
    fn row_blocks_put_primary_keys_first() {
        let block = Block::from(change(
            ChangeOp::Insert,
            &["region", "id"],
            &[("amount", Some("5")), ("id", Some("1")), ("region", Some("eu"))],
        ));

        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "table": "public.orders",
                "op": "I",
                "header": ["region", "id", "amount"],
                "pks": 2,
                "rows": [["eu", "1", "5"]],
                "ev_id": 9
            })
        );
    }

    #[test]
    fn truncate_blocks_only_name_the_table() {
        let block = Block::from(change(ChangeOp::Replace, &[], &[]));

        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"table": "public.orders", "op": "R", "ev_id": 9})
        );
    }
}
