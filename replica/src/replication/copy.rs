use std::future::Future;

use tracing::{info, warn};

use crate::conversions::statements::split_statements;
use crate::destination::DestinationSession;
use crate::error::{ReplicaError, ReplicaResult};
use crate::replication::sync::save_table_state;
use crate::state::snapshot::CopySnapshot;
use crate::state::table::{TableState, TableSyncPhase};
use crate::store::state::StateStore;
use crate::types::BatchInfo;
use crate::workers::base::WorkerRole;

/// What a bulk copy has to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub queue: String,
    pub table: String,
    pub dest_table: String,
    /// Row filter of the table handler, applied on the source.
    pub condition: Option<String>,
}

impl CopyRequest {
    pub fn for_table(queue: &str, table: &TableState, condition: Option<&str>) -> Self {
        Self {
            queue: queue.to_owned(),
            table: table.name.clone(),
            dest_table: table.dest_table.clone(),
            condition: condition.map(str::to_owned),
        }
    }
}

/// Performs the bulk copy of one table.
///
/// The delegate must read the source at a consistency point known to the queue and
/// return it: every event with a tick at or before the returned snapshot has to be
/// contained in the copied rows.
pub trait CopyDelegate: Clone + Send + Sync + 'static {
    fn copy_table(
        &self,
        request: &CopyRequest,
    ) -> impl Future<Output = ReplicaResult<CopySnapshot>> + Send;
}

/// Drops the foreign keys of the destination table before the copy.
///
/// Each restore statement is persisted in `dropped_ddl` before its key is dropped, one
/// key per transaction, so a restart neither loses nor duplicates a key.
pub async fn suspend_foreign_keys<D, S>(
    session: &mut D,
    store: &S,
    queue: &str,
    table: &mut TableState,
) -> ReplicaResult<()>
where
    D: DestinationSession + Send,
    S: StateStore,
{
    let foreign_keys = session.table_foreign_keys(&table.dest_table).await?;

    for foreign_key in foreign_keys {
        let known = table.dropped_ddl.as_deref().is_some_and(|ddl| {
            split_statements(ddl)
                .iter()
                .any(|statement| *statement == foreign_key.restore_sql)
        });
        if !known {
            table.dropped_ddl = Some(append_statement(
                table.dropped_ddl.as_deref(),
                &foreign_key.restore_sql,
            ));
            table.mark_dirty();
            save_table_state(store, queue, table).await?;
        }

        info!(table = %table.name, foreign_key = %foreign_key.name, "dropping foreign key");
        session.begin().await?;
        session.drop_foreign_key(&foreign_key).await?;
        session.commit().await?;
    }

    Ok(())
}

/// Runs the statements stored in `dropped_ddl`, one per transaction, then refreshes the
/// table statistics.
pub async fn restore_dropped_ddl<D, S>(
    session: &mut D,
    store: &S,
    queue: &str,
    table: &mut TableState,
) -> ReplicaResult<()>
where
    D: DestinationSession + Send,
    S: StateStore,
{
    let Some(ddl) = table.dropped_ddl.clone() else {
        return Ok(());
    };

    let mut remaining = split_statements(&ddl);
    while !remaining.is_empty() {
        let statement = remaining.remove(0);
        info!(table = %table.name, statement, "restoring dropped ddl");

        session.begin().await?;
        session.execute(&statement).await?;
        session.commit().await?;

        table.dropped_ddl = (!remaining.is_empty()).then(|| remaining.join(";\n") + ";");
        table.mark_dirty();
        save_table_state(store, queue, table).await?;
    }

    session.analyze(&table.dest_table).await?;

    Ok(())
}

fn append_statement(ddl: Option<&str>, statement: &str) -> String {
    match ddl {
        Some(ddl) if !ddl.trim().is_empty() => format!("{}\n{statement};", ddl.trim_end()),
        _ => format!("{statement};"),
    }
}

/// Forgets the copy snapshot of `table` once no event of the current position can be
/// covered by it anymore.
///
/// The first batch processed without lag records its tick, the snapshot is dropped once
/// a later batch starts past that tick. Returns `true` when the snapshot was dropped.
pub fn gc_snapshot(table: &mut TableState, role: &WorkerRole, batch: &BatchInfo, no_lag: bool) -> bool {
    if table.snapshot.is_none() {
        return false;
    }

    let owned = match role {
        WorkerRole::Main => table.phase() == TableSyncPhase::Ok,
        WorkerRole::Copy { table: copy_table } => {
            table.name == *copy_table && table.phase() == TableSyncPhase::CatchingUp
        }
    };
    if !owned {
        return false;
    }

    match table.last_snapshot_tick {
        None => {
            if no_lag {
                table.last_snapshot_tick = Some(batch.tick_id);
            }
            false
        }
        Some(tick_id) if tick_id < batch.prev_tick_id => {
            if let Some(snapshot) = table.snapshot.take() {
                info!(table = %table.name, %snapshot, "dropping copy snapshot");
            }
            table.last_snapshot_tick = None;
            table.mark_dirty();
            true
        }
        Some(_) => false,
    }
}

/// Logs a failed copy. The table stays in `IN_COPY` until an operator steps in.
pub fn report_copy_failure(table: &TableState, error: &ReplicaError) {
    warn!(
        table = %table.name,
        error = %error,
        manual_intervention = true,
        "bulk copy failed, table left in copy"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::destination::ForeignKey;
    use crate::destination::memory::MemoryDestination;
    use crate::store::state::MemoryStateStore;

    const QUEUE: &str = "replika";

    fn foreign_key(name: &str) -> ForeignKey {
        ForeignKey {
            name: name.to_owned(),
            table: "public.orders".to_owned(),
            referenced_table: "public.customers".to_owned(),
            restore_sql: format!(
                "alter table only public.orders add constraint {name} foreign key (customer_id) references public.customers(id)"
            ),
        }
    }

    #[tokio::test]
    async fn foreign_keys_are_dropped_and_restored() {
        let store = MemoryStateStore::new();
        let destination = MemoryDestination::new();
        destination.add_foreign_key(foreign_key("orders_customer_fkey")).await;
        destination.add_foreign_key(foreign_key("orders_seller_fkey")).await;

        let mut table = TableState::new("orders", None);
        store.register_table(QUEUE, table.clone()).await.unwrap();
        let mut session = destination.open_session().await.unwrap();

        suspend_foreign_keys(&mut session, &store, QUEUE, &mut table)
            .await
            .unwrap();
        assert!(destination.foreign_keys().await.is_empty());

        let stored = store.table_state(QUEUE, "public.orders").await.unwrap();
        assert_eq!(
            split_statements(stored.dropped_ddl.as_deref().unwrap()).len(),
            2
        );

        // A second pass neither duplicates restore statements nor fails.
        suspend_foreign_keys(&mut session, &store, QUEUE, &mut table)
            .await
            .unwrap();
        assert_eq!(
            split_statements(table.dropped_ddl.as_deref().unwrap()).len(),
            2
        );

        restore_dropped_ddl(&mut session, &store, QUEUE, &mut table)
            .await
            .unwrap();
        assert_eq!(destination.foreign_keys().await.len(), 2);
        assert_eq!(destination.analyzed().await, vec!["public.orders"]);
        assert!(table.dropped_ddl.is_none());
        assert!(
            store
                .table_state(QUEUE, "public.orders")
                .await
                .unwrap()
                .dropped_ddl
                .is_none()
        );
    }

    #[test]
    fn snapshot_is_kept_until_the_position_moved_past_it() {
        let mut table = TableState::new("orders", None).with_phase(TableSyncPhase::Ok);
        table.snapshot = Some(CopySnapshot::new(4));
        let batch = |prev_tick_id, tick_id| BatchInfo {
            batch_id: tick_id,
            prev_tick_id,
            tick_id,
        };

        assert!(!gc_snapshot(&mut table, &WorkerRole::Main, &batch(5, 6), false));
        assert_eq!(table.last_snapshot_tick, None);

        assert!(!gc_snapshot(&mut table, &WorkerRole::Main, &batch(6, 7), true));
        assert_eq!(table.last_snapshot_tick, Some(7));

        assert!(!gc_snapshot(&mut table, &WorkerRole::Main, &batch(7, 8), true));
        assert!(gc_snapshot(&mut table, &WorkerRole::Main, &batch(8, 9), true));
        assert!(table.snapshot.is_none());
        assert!(table.is_dirty());
    }

    #[test]
    fn copy_worker_only_collects_its_own_snapshot() {
        let mut table = TableState::new("orders", None).with_phase(TableSyncPhase::CatchingUp);
        table.snapshot = Some(CopySnapshot::new(4));
        table.last_snapshot_tick = Some(5);
        let batch = BatchInfo {
            batch_id: 1,
            prev_tick_id: 8,
            tick_id: 9,
        };

        let other = WorkerRole::Copy {
            table: "public.items".to_owned(),
        };
        assert!(!gc_snapshot(&mut table, &other, &batch, true));
        assert!(!gc_snapshot(&mut table, &WorkerRole::Main, &batch, true));

        let own = WorkerRole::Copy {
            table: "public.orders".to_owned(),
        };
        assert!(gc_snapshot(&mut table, &own, &batch, true));
    }
}
