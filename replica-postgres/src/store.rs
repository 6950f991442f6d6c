use std::collections::BTreeMap;

use replica::error::{ErrorKind, ReplicaResult};
use replica::replica_error;
use replica::state::snapshot::CopySnapshot;
use replica::state::table::{CopyRole, HandlerSpec, TableState, TableSyncPhase};
use replica::store::state::{ExecuteStatus, StateStore};
use sqlx::PgPool;
use sqlx::prelude::FromRow;
use tracing::debug;

use crate::error::sqlx_error;

/// Database row of `replica.table_state`.
#[derive(Debug, FromRow)]
struct TableStateRow {
    table_name: String,
    dest_table: String,
    merge_state: Option<String>,
    custom_snapshot: Option<i64>,
    copy_role: Option<String>,
    copy_node: Option<String>,
    dropped_ddl: Option<String>,
    table_handler: Option<String>,
    handler_args: serde_json::Value,
}

impl TryFrom<TableStateRow> for TableState {
    type Error = replica::error::ReplicaError;

    fn try_from(row: TableStateRow) -> ReplicaResult<TableState> {
        let phase = TableSyncPhase::from_storage(row.merge_state.as_deref())?;
        let args: BTreeMap<String, String> = serde_json::from_value(row.handler_args)?;

        let mut state = TableState::new(&row.table_name, Some(&row.dest_table))
            .with_phase(phase)
            .with_handler(HandlerSpec {
                name: row.table_handler,
                args,
            });
        state.snapshot = row.custom_snapshot.map(CopySnapshot::new);
        state.copy_role = row.copy_role.as_deref().map(CopyRole::parse).transpose()?;
        state.copy_node = row.copy_node;
        state.dropped_ddl = row.dropped_ddl;

        Ok(state)
    }
}

/// [`StateStore`] keeping the table states in the `replica` schema.
///
/// Writes are committed on their own, outside of the destination transaction of the batch
/// that produced them. A batch that fails after saving a state replays its events on top
/// of the already saved phase; the phase graph only moves forward so a replay converges.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl StateStore for PostgresStateStore {
    async fn load_states(&self, queue: &str) -> ReplicaResult<Vec<TableState>> {
        let rows: Vec<TableStateRow> = sqlx::query_as(
            r#"
            select table_name, dest_table, merge_state, custom_snapshot, copy_role, copy_node,
                   dropped_ddl, table_handler, handler_args
            from replica.table_state
            where queue_name = $1
            order by id
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)?;

        rows.into_iter().map(TableState::try_from).collect()
    }

    async fn save_state(&self, queue: &str, state: &TableState) -> ReplicaResult<()> {
        let result = sqlx::query(
            r#"
            update replica.table_state
            set merge_state = $3, custom_snapshot = $4, copy_role = $5, dropped_ddl = $6,
                updated_at = now()
            where queue_name = $1 and table_name = $2
            "#,
        )
        .bind(queue)
        .bind(&state.name)
        .bind(state.phase().to_storage())
        .bind(state.snapshot.map(|snapshot| snapshot.tick_id()))
        .bind(state.copy_role.map(|role| role.as_str()))
        .bind(state.dropped_ddl.as_deref())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(replica_error!(
                ErrorKind::TableNotFound,
                "Table is not registered on this node",
                state.name
            ));
        }

        debug!(table = %state.name, phase = %state.phase(), "saved table state");

        Ok(())
    }

    async fn register_table(&self, queue: &str, state: TableState) -> ReplicaResult<()> {
        let handler_args = serde_json::to_value(&state.handler.args)?;

        let mut tx = self.pool.begin().await.map_err(sqlx_error)?;

        let inserted = sqlx::query(
            r#"
            insert into replica.table_state
                (queue_name, table_name, dest_table, merge_state, custom_snapshot, copy_role,
                 copy_node, dropped_ddl, table_handler, handler_args)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            on conflict (queue_name, table_name) do nothing
            "#,
        )
        .bind(queue)
        .bind(&state.name)
        .bind(&state.dest_table)
        .bind(state.phase().to_storage())
        .bind(state.snapshot.map(|snapshot| snapshot.tick_id()))
        .bind(state.copy_role.map(|role| role.as_str()))
        .bind(state.copy_node.as_deref())
        .bind(state.dropped_ddl.as_deref())
        .bind(state.handler.name.as_deref())
        .bind(handler_args)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error)?;

        if inserted.rows_affected() == 0 {
            return Err(replica_error!(
                ErrorKind::InvalidState,
                "Table is already registered on this node",
                state.name
            ));
        }

        sqlx::query(
            r#"
            insert into replica.global_table (queue_name, table_name)
            values ($1, $2)
            on conflict (queue_name, table_name) do nothing
            "#,
        )
        .bind(queue)
        .bind(&state.name)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error)?;

        tx.commit().await.map_err(sqlx_error)?;

        Ok(())
    }

    async fn delete_state(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        sqlx::query("delete from replica.table_state where queue_name = $1 and table_name = $2")
            .bind(queue)
            .bind(table)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error)?;

        Ok(())
    }

    async fn register_execute(
        &self,
        queue: &str,
        name: &str,
        sql: &str,
        attrs: Option<&str>,
    ) -> ReplicaResult<ExecuteStatus> {
        // An unfinished registration belongs to a batch that failed, it runs again.
        let registered: Option<bool> = sqlx::query_scalar(
            r#"
            insert into replica.applied_execute (queue_name, execute_name, execute_sql, execute_attrs)
            values ($1, $2, $3, $4)
            on conflict (queue_name, execute_name) do update
                set execute_sql = excluded.execute_sql,
                    execute_attrs = excluded.execute_attrs,
                    executed_at = now()
                where not replica.applied_execute.finished
            returning true
            "#,
        )
        .bind(queue)
        .bind(name)
        .bind(sql)
        .bind(attrs)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;

        match registered {
            Some(_) => Ok(ExecuteStatus::EXECUTE),
            None => Ok(ExecuteStatus::ALREADY_APPLIED),
        }
    }

    async fn finish_execute(&self, queue: &str, name: &str) -> ReplicaResult<()> {
        let result = sqlx::query(
            r#"
            update replica.applied_execute
            set finished = true
            where queue_name = $1 and execute_name = $2
            "#,
        )
        .bind(queue)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(replica_error!(
                ErrorKind::InvalidState,
                "Execute event was never registered",
                name
            ));
        }

        Ok(())
    }

    async fn add_global_table(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        sqlx::query(
            r#"
            insert into replica.global_table (queue_name, table_name)
            values ($1, $2)
            on conflict (queue_name, table_name) do nothing
            "#,
        )
        .bind(queue)
        .bind(table)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn remove_global_table(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        sqlx::query("delete from replica.global_table where queue_name = $1 and table_name = $2")
            .bind(queue)
            .bind(table)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error)?;

        Ok(())
    }

    async fn remove_global_seq(&self, queue: &str, seq: &str) -> ReplicaResult<()> {
        sqlx::query("delete from replica.global_seq where queue_name = $1 and seq_name = $2")
            .bind(queue)
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error)?;

        Ok(())
    }

    async fn local_sequences(&self, queue: &str) -> ReplicaResult<Vec<String>> {
        sqlx::query_scalar(
            r#"
            select seq_name from replica.global_seq
            where queue_name = $1 and is_local
            order by seq_name
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(merge_state: Option<&str>) -> TableStateRow {
        TableStateRow {
            table_name: "public.orders".to_owned(),
            dest_table: "archive.orders".to_owned(),
            merge_state: merge_state.map(str::to_owned),
            custom_snapshot: Some(17),
            copy_role: Some("wait-replay".to_owned()),
            copy_node: None,
            dropped_ddl: None,
            table_handler: Some("column_mapper".to_owned()),
            handler_args: serde_json::json!({"map": "id:order_id"}),
        }
    }

    #[test]
    fn rows_are_decoded_into_table_states() {
        let state = TableState::try_from(row(Some("do-sync:20"))).unwrap();

        assert_eq!(state.name, "public.orders");
        assert_eq!(state.dest_table, "archive.orders");
        assert_eq!(state.phase(), TableSyncPhase::DoSync { sync_tick_id: 20 });
        assert_eq!(state.snapshot, Some(CopySnapshot::new(17)));
        assert_eq!(state.copy_role, Some(CopyRole::WaitReplay));
        assert_eq!(state.handler.name.as_deref(), Some("column_mapper"));
        assert_eq!(state.handler.args.get("map").map(String::as_str), Some("id:order_id"));
    }

    #[test]
    fn unknown_merge_states_are_rejected() {
        let err = TableState::try_from(row(Some("copying"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
