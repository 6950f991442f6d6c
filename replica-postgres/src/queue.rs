use std::sync::Arc;
use std::time::Duration;

use replica::error::ReplicaResult;
use replica::state::table::TableSyncPhase;
use replica::transport::{ProviderTableStates, QueueTransport};
use replica::types::{Batch, BatchInfo, BatchWindow, Event, TickId};
use tokio_postgres::Client;
use tracing::{debug, info};

/// Events of an open batch, each with the first tick of the batch whose snapshot sees it.
///
/// Events of merged batches would otherwise all carry the last tick of the batch.
const BATCH_EVENTS_QUERY: &str = r#"
    select ev.ev_id, ev.ev_type, ev.ev_data, ev.ev_extra1, ev.ev_extra2,
           coalesce(
               (select min(t.tick_id)
                from pgq.tick t
                join pgq.queue q on q.queue_id = t.tick_queue
                where q.queue_name = $2
                  and t.tick_id > $3
                  and t.tick_id <= $4
                  and txid_visible_in_snapshot(ev.ev_txid, t.tick_snapshot)),
               $4
           ) as ev_tick_id
    from pgq.get_batch_events($1) ev
    order by ev.ev_id
"#;

/// Columns of one row of [`BATCH_EVENTS_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct EventRow {
    ev_id: i64,
    ev_tick_id: i64,
    ev_type: Option<String>,
    ev_data: Option<String>,
    /// Table of row events, name of execute events, target of control events.
    ev_extra1: Option<String>,
    /// Url-encoded attributes of execute events.
    ev_extra2: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event::from_queue(
            self.ev_id,
            self.ev_tick_id,
            self.ev_type.as_deref().unwrap_or_default(),
            self.ev_data.unwrap_or_default(),
            self.ev_extra1,
            self.ev_extra2,
        )
    }
}

/// Renders `duration` as a Postgres interval literal.
fn interval_literal(duration: Duration) -> String {
    format!("{} milliseconds", duration.as_millis())
}

/// Arguments of `pgq.next_batch_custom` for `window`: minimal event count and interval.
fn window_arguments(window: &BatchWindow) -> (Option<i32>, Option<String>) {
    let min_count = window
        .min_count
        .map(|count| i32::try_from(count).unwrap_or(i32::MAX));
    let min_interval = window.min_interval.map(interval_literal);

    (min_count, min_interval)
}

/// [`QueueTransport`] over a PgQ queue of the source database.
#[derive(Debug, Clone)]
pub struct PgqTransport {
    client: Arc<Client>,
    queue_name: Arc<str>,
}

impl PgqTransport {
    pub fn new(client: Client, queue_name: &str) -> Self {
        Self {
            client: Arc::new(client),
            queue_name: Arc::from(queue_name),
        }
    }

    async fn consumer_exists(&self, consumer: &str) -> ReplicaResult<bool> {
        let rows = self
            .client
            .query(
                "select 1 from pgq.get_consumer_info($1, $2)",
                &[&&*self.queue_name, &consumer],
            )
            .await?;

        Ok(!rows.is_empty())
    }

    async fn batch_events(&self, info: &BatchInfo) -> ReplicaResult<Vec<Event>> {
        let rows = self
            .client
            .query(
                BATCH_EVENTS_QUERY,
                &[
                    &info.batch_id,
                    &&*self.queue_name,
                    &info.prev_tick_id,
                    &info.tick_id,
                ],
            )
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_row = EventRow {
                ev_id: row.try_get("ev_id")?,
                ev_tick_id: row.try_get("ev_tick_id")?,
                ev_type: row.try_get("ev_type")?,
                ev_data: row.try_get("ev_data")?,
                ev_extra1: row.try_get("ev_extra1")?,
                ev_extra2: row.try_get("ev_extra2")?,
            };
            events.push(event_row.into_event());
        }

        Ok(events)
    }
}

impl QueueTransport for PgqTransport {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn next_batch(&self, consumer: &str, window: &BatchWindow) -> ReplicaResult<Option<Batch>> {
        let (min_count, min_interval) = window_arguments(window);

        let row = self
            .client
            .query_one(
                r#"
                select batch_id, cur_tick_id, prev_tick_id
                from pgq.next_batch_custom($1, $2, null, $3::int4, $4::text::interval)
                "#,
                &[&&*self.queue_name, &consumer, &min_count, &min_interval],
            )
            .await?;

        let Some(batch_id) = row.try_get::<_, Option<i64>>("batch_id")? else {
            return Ok(None);
        };

        let info = BatchInfo {
            batch_id,
            prev_tick_id: row.try_get("prev_tick_id")?,
            tick_id: row.try_get("cur_tick_id")?,
        };
        let events = self.batch_events(&info).await?;

        debug!(
            %consumer,
            batch_id,
            prev_tick_id = info.prev_tick_id,
            tick_id = info.tick_id,
            events = events.len(),
            "received batch"
        );

        Ok(Some(Batch { info, events }))
    }

    async fn ack(&self, consumer: &str, batch: &BatchInfo) -> ReplicaResult<()> {
        self.client
            .execute("select pgq.finish_batch($1)", &[&batch.batch_id])
            .await?;

        debug!(%consumer, batch_id = batch.batch_id, tick_id = batch.tick_id, "finished batch");

        Ok(())
    }

    async fn register_consumer(&self, consumer: &str, at_tick: Option<TickId>) -> ReplicaResult<()> {
        if self.consumer_exists(consumer).await? {
            debug!(%consumer, "consumer already registered, keeping its position");
            return Ok(());
        }

        match at_tick {
            Some(tick_id) => {
                self.client
                    .execute(
                        "select pgq.register_consumer_at($1, $2, $3)",
                        &[&&*self.queue_name, &consumer, &tick_id],
                    )
                    .await?;
            }
            None => {
                self.client
                    .execute(
                        "select pgq.register_consumer($1, $2)",
                        &[&&*self.queue_name, &consumer],
                    )
                    .await?;
            }
        }

        info!(queue = %self.queue_name, %consumer, ?at_tick, "registered consumer");

        Ok(())
    }

    async fn unregister_consumer(&self, consumer: &str) -> ReplicaResult<()> {
        if !self.consumer_exists(consumer).await? {
            return Ok(());
        }

        self.client
            .execute(
                "select pgq.unregister_consumer($1, $2)",
                &[&&*self.queue_name, &consumer],
            )
            .await?;

        info!(queue = %self.queue_name, %consumer, "unregistered consumer");

        Ok(())
    }

    /// Reads the table states kept by a replica worker on the source node.
    ///
    /// A source without the `replica` schema is the root of the queue.
    async fn provider_table_states(&self) -> ReplicaResult<Option<ProviderTableStates>> {
        let row = self
            .client
            .query_one(
                "select to_regclass('replica.table_state') is not null as has_states",
                &[],
            )
            .await?;
        if !row.try_get::<_, bool>("has_states")? {
            return Ok(None);
        }

        let rows = self
            .client
            .query(
                "select table_name, merge_state from replica.table_state where queue_name = $1",
                &[&&*self.queue_name],
            )
            .await?;

        let mut states = ProviderTableStates::with_capacity(rows.len());
        for row in rows {
            let merge_state: Option<String> = row.try_get("merge_state")?;
            states.insert(
                row.try_get("table_name")?,
                TableSyncPhase::from_storage(merge_state.as_deref())?,
            );
        }

        Ok(Some(states))
    }
}

#[cfg(test)]
mod tests {
    use replica::handlers::HandlerRegistry;
    use replica::replication::dispatch::{DispatchAction, EventDispatcher};
    use replica::replication::execute::ExecAttrs;
    use replica::state::map::TableMap;
    use replica::types::EventKind;
    use replica::workers::base::WorkerRole;

    use super::*;

    #[test]
    fn execute_rows_carry_their_attributes() {
        let row = EventRow {
            ev_id: 11,
            ev_tick_id: 4,
            ev_type: Some("EXECUTE".to_owned()),
            ev_data: Some("alter table @orders@ add note text".to_owned()),
            ev_extra1: Some("0005_note.sql".to_owned()),
            ev_extra2: Some("local_table=public.orders".to_owned()),
        };

        let event = row.into_event();
        assert_eq!(event.kind, EventKind::Execute);
        assert_eq!(event.table_name.as_deref(), Some("0005_note.sql"));
        assert_eq!(event.attrs.as_deref(), Some("local_table=public.orders"));

        let mut dispatcher =
            EventDispatcher::new(WorkerRole::Main, Arc::new(HandlerRegistry::default()));
        let action = dispatcher.dispatch(&event, &TableMap::default()).unwrap();
        let DispatchAction::Execute(request) = action else {
            panic!("expected an execute, got {action:?}");
        };
        assert_eq!(request.attrs.as_deref(), Some("local_table=public.orders"));
        assert!(
            !ExecAttrs::parse(request.attrs.as_deref())
                .unwrap()
                .is_local(&TableMap::default(), &[])
        );
    }

    #[test]
    fn empty_window_passes_nulls() {
        assert_eq!(window_arguments(&BatchWindow::default()), (None, None));
    }

    #[test]
    fn window_is_rendered_as_count_and_interval() {
        let window = BatchWindow {
            min_count: Some(u64::MAX),
            min_interval: Some(Duration::from_millis(1500)),
        };

        assert_eq!(
            window_arguments(&window),
            (Some(i32::MAX), Some("1500 milliseconds".to_owned()))
        );
    }
}
