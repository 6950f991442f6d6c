use std::sync::Arc;

use pg_escape::quote_identifier;
use replica::conversions::name::quote_fq_ident;
use replica::conversions::sql::render_change_sql;
use replica::destination::{
    Destination, DestinationSession, ForeignKey, ObjectKind, ReplicationRole,
};
use replica::error::ReplicaResult;
use replica::types::{RowChange, TickId};
use replica_config::shared::PgConnectionConfig;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::connection::connect;

/// Foreign keys owned by or referencing a table, with the statement re-creating each.
///
/// Table names are rendered by `regclass` and thus already quoted where needed.
const FOREIGN_KEYS_QUERY: &str = r#"
    select c.conname,
           c.conrelid::regclass::text as owner_table,
           c.confrelid::regclass::text as referenced_table,
           pg_catalog.pg_get_constraintdef(c.oid) as definition
    from pg_catalog.pg_constraint c
    where c.contype = 'f'
      and (c.conrelid = $1::text::regclass or c.confrelid = $1::text::regclass)
    order by c.conname
"#;

/// Existence check of an object of `kind`, bound to the object's name.
fn object_exists_query(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Table => {
            "select exists (select 1 from pg_catalog.pg_class \
             where oid = to_regclass($1::text) and relkind in ('r', 'p'))"
        }
        ObjectKind::Sequence => {
            "select exists (select 1 from pg_catalog.pg_class \
             where oid = to_regclass($1::text) and relkind = 'S')"
        }
        ObjectKind::View => {
            "select exists (select 1 from pg_catalog.pg_class \
             where oid = to_regclass($1::text) and relkind in ('v', 'm'))"
        }
        ObjectKind::Function => {
            "select exists (select 1 from pg_catalog.pg_proc p \
             join pg_catalog.pg_namespace n on n.oid = p.pronamespace \
             where n.nspname || '.' || p.proname = $1)"
        }
        ObjectKind::Schema => {
            "select exists (select 1 from pg_catalog.pg_namespace where nspname = $1)"
        }
    }
}

/// Name bound to [`object_exists_query`]: relations go through `to_regclass` and need
/// quoting, functions and schemas are compared to the catalog names.
fn object_exists_argument(kind: ObjectKind, name: &str) -> String {
    match kind {
        ObjectKind::Table | ObjectKind::Sequence | ObjectKind::View => quote_fq_ident(name),
        ObjectKind::Function | ObjectKind::Schema => kind.normalize(name),
    }
}

fn restore_foreign_key_sql(owner_table: &str, name: &str, definition: &str) -> String {
    format!(
        "alter table only {owner_table} add constraint {} {definition}",
        quote_identifier(name)
    )
}

fn drop_foreign_key_sql(foreign_key: &ForeignKey) -> String {
    format!(
        "alter table only {} drop constraint if exists {}",
        foreign_key.table,
        quote_identifier(&foreign_key.name)
    )
}

/// [`Destination`] writing to a Postgres database, one connection per session.
#[derive(Debug, Clone)]
pub struct PostgresDestination {
    config: Arc<PgConnectionConfig>,
}

impl PostgresDestination {
    pub fn new(config: PgConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Destination for PostgresDestination {
    type Session = PostgresSession;

    async fn open_session(&self) -> ReplicaResult<PostgresSession> {
        let client = connect(&self.config).await?;

        let mut session = PostgresSession { client };
        session.set_replication_role(ReplicationRole::Replica).await?;

        Ok(session)
    }
}

#[derive(Debug)]
pub struct PostgresSession {
    client: Client,
}

impl DestinationSession for PostgresSession {
    async fn begin(&mut self) -> ReplicaResult<()> {
        self.client.batch_execute("begin").await?;

        Ok(())
    }

    async fn commit(&mut self) -> ReplicaResult<()> {
        self.client.batch_execute("commit").await?;

        Ok(())
    }

    async fn rollback(&mut self) -> ReplicaResult<()> {
        self.client.batch_execute("rollback").await?;

        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> ReplicaResult<()> {
        self.client.batch_execute(sql).await?;

        Ok(())
    }

    async fn apply_change(&mut self, change: &RowChange) -> ReplicaResult<()> {
        let sql = render_change_sql(change)?;
        self.client.batch_execute(&sql).await?;

        Ok(())
    }

    async fn set_replication_role(&mut self, role: ReplicationRole) -> ReplicaResult<()> {
        self.client
            .batch_execute(&format!("set session_replication_role = {}", role.as_str()))
            .await?;

        debug!(%role, "changed session replication role");

        Ok(())
    }

    async fn table_foreign_keys(&mut self, table: &str) -> ReplicaResult<Vec<ForeignKey>> {
        let table = quote_fq_ident(table);
        let rows = self.client.query(FOREIGN_KEYS_QUERY, &[&table]).await?;

        let mut foreign_keys = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("conname")?;
            let owner_table: String = row.try_get("owner_table")?;
            let definition: String = row.try_get("definition")?;

            foreign_keys.push(ForeignKey {
                restore_sql: restore_foreign_key_sql(&owner_table, &name, &definition),
                name,
                table: owner_table,
                referenced_table: row.try_get("referenced_table")?,
            });
        }

        Ok(foreign_keys)
    }

    async fn drop_foreign_key(&mut self, foreign_key: &ForeignKey) -> ReplicaResult<()> {
        self.client
            .batch_execute(&drop_foreign_key_sql(foreign_key))
            .await?;

        info!(table = %foreign_key.table, foreign_key = %foreign_key.name, "dropped foreign key");

        Ok(())
    }

    async fn object_exists(&mut self, kind: ObjectKind, name: &str) -> ReplicaResult<bool> {
        let argument = object_exists_argument(kind, name);
        let exists: bool = self
            .client
            .query_one(object_exists_query(kind), &[&argument])
            .await?
            .try_get(0)?;

        debug!(%kind, %name, exists, "checked destination object");

        Ok(exists)
    }

    async fn analyze(&mut self, table: &str) -> ReplicaResult<()> {
        self.client
            .batch_execute(&format!("analyze {}", quote_fq_ident(table)))
            .await?;

        Ok(())
    }

    async fn set_sequence(&mut self, seq: &str, value: i64) -> ReplicaResult<()> {
        let seq = quote_fq_ident(seq);
        self.client
            .execute("select pg_catalog.setval($1::text::regclass, $2)", &[&seq, &value])
            .await?;

        Ok(())
    }

    async fn completed_tick(&mut self, consumer: &str) -> ReplicaResult<Option<TickId>> {
        let row = self
            .client
            .query_opt(
                "select last_tick_id from replica.completed_tick where consumer_name = $1",
                &[&consumer],
            )
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("last_tick_id")?)),
            None => Ok(None),
        }
    }

    async fn set_completed_tick(&mut self, consumer: &str, tick_id: TickId) -> ReplicaResult<()> {
        self.client
            .execute(
                r#"
                insert into replica.completed_tick (consumer_name, last_tick_id)
                values ($1, $2)
                on conflict (consumer_name) do update
                    set last_tick_id = excluded.last_tick_id, updated_at = now()
                "#,
                &[&consumer, &tick_id],
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_keys_are_restored_on_their_owner_table() {
        let sql = restore_foreign_key_sql(
            "sales.\"Order\"",
            "order_customer_fk",
            "FOREIGN KEY (customer_id) REFERENCES customers(id)",
        );

        assert_eq!(
            sql,
            "alter table only sales.\"Order\" add constraint order_customer_fk \
             FOREIGN KEY (customer_id) REFERENCES customers(id)"
        );
    }

    #[test]
    fn object_names_are_bound_per_kind() {
        assert_eq!(
            object_exists_argument(ObjectKind::Table, "Orders"),
            "public.\"Orders\""
        );
        assert_eq!(
            object_exists_argument(ObjectKind::Function, "billing.total"),
            "billing.total"
        );
        assert_eq!(object_exists_argument(ObjectKind::Function, "total"), "public.total");
        assert_eq!(object_exists_argument(ObjectKind::Schema, "billing"), "billing");
        assert!(object_exists_query(ObjectKind::Sequence).contains("relkind = 'S'"));
    }

    #[test]
    fn foreign_key_names_are_quoted_when_dropped() {
        let foreign_key = ForeignKey {
            name: "Order FK".to_owned(),
            table: "orders".to_owned(),
            referenced_table: "customers".to_owned(),
            restore_sql: String::new(),
        };

        assert_eq!(
            drop_foreign_key_sql(&foreign_key),
            "alter table only orders drop constraint if exists \"Order FK\""
        );
    }
}
