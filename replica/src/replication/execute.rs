use tracing::{debug, info, warn};

use crate::conversions::name::{fq_name, quote_fq_ident};
use crate::conversions::statements::split_statements;
use crate::conversions::urlenc::decode_pairs;
use crate::destination::{DestinationSession, ObjectKind, ReplicationRole};
use crate::error::ReplicaResult;
use crate::state::map::TableMap;
use crate::store::state::StateStore;
use crate::types::{Event, EventKind};

/// A schema change broadcast through the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Unique name of the execute, e.g. the file it was read from.
    pub name: String,
    pub sql: String,
    /// Url-encoded [`ExecAttrs`].
    pub attrs: Option<String>,
}

/// Restrictions of an execute to some nodes.
///
/// Encoded as `local_table=a,b&local_sequence=c&need_schema=d`. Keys may repeat. `local_*`
/// keys select nodes replicating one of the listed tables or sequences, `need_*` keys
/// select nodes where every listed object exists in the destination. An execute without
/// restrictions runs everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecAttrs {
    local_tables: Vec<String>,
    local_sequences: Vec<String>,
    needed_objects: Vec<(ObjectKind, String)>,
}

impl ExecAttrs {
    /// Parses url-encoded attributes. Unknown keys are logged and ignored.
    pub fn parse(attrs: Option<&str>) -> ReplicaResult<ExecAttrs> {
        let mut exec_attrs = ExecAttrs::default();
        let Some(attrs) = attrs else {
            return Ok(exec_attrs);
        };

        for (key, value) in decode_pairs(attrs)? {
            let names = value
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned);

            let needed_kind = match key.as_str() {
                "local_table" => {
                    exec_attrs.local_tables.extend(names);
                    continue;
                }
                "local_sequence" => {
                    exec_attrs.local_sequences.extend(names);
                    continue;
                }
                "need_table" => ObjectKind::Table,
                "need_sequence" => ObjectKind::Sequence,
                "need_function" => ObjectKind::Function,
                "need_view" => ObjectKind::View,
                "need_schema" => ObjectKind::Schema,
                _ => {
                    warn!(%key, "ignoring unknown execute attribute");
                    continue;
                }
            };

            exec_attrs
                .needed_objects
                .extend(names.map(|name| (needed_kind, needed_kind.normalize(&name))));
        }

        Ok(exec_attrs)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.local_tables.is_empty()
            && self.local_sequences.is_empty()
            && self.needed_objects.is_empty()
    }

    /// Returns `true` when no `local_*` key is given or at least one of the referenced
    /// tables or sequences is replicated here.
    pub fn is_local(&self, tables: &TableMap, local_sequences: &[String]) -> bool {
        if self.local_tables.is_empty() && self.local_sequences.is_empty() {
            return true;
        }

        self.local_tables
            .iter()
            .any(|table| tables.get(table).is_some())
            || self
                .local_sequences
                .iter()
                .any(|seq| local_sequences.contains(&fq_name(seq)))
    }

    /// Returns `true` when the execute applies to this node: it is local here and every
    /// needed object exists in the destination.
    pub async fn need_execute<D>(
        &self,
        session: &mut D,
        tables: &TableMap,
        local_sequences: &[String],
    ) -> ReplicaResult<bool>
    where
        D: DestinationSession + Send,
    {
        if !self.is_local(tables, local_sequences) {
            return Ok(false);
        }

        for (kind, name) in &self.needed_objects {
            if !session.object_exists(*kind, name).await? {
                debug!(%kind, %name, "needed object is missing on this node");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Rewrites `@table@` placeholders of referenced local tables to their quoted
    /// destination names.
    pub fn process_sql(&self, sql: &str, tables: &TableMap) -> String {
        let mut sql = sql.to_owned();
        for name in &self.local_tables {
            if let Some(table) = tables.get(name) {
                sql = sql.replace(&format!("@{name}@"), &quote_fq_ident(&table.dest_table));
            }
        }

        sql
    }
}

/// Runs execute events at most once per node.
///
/// Statements run inside the batch transaction. An execute is recorded as finished only
/// after that transaction committed, so a batch that fails or gets interrupted before
/// its commit runs its executes again on retry.
#[derive(Debug, Default)]
pub struct ExecuteCoordinator {
    /// Executes handled in the open batch transaction.
    batch: Vec<String>,
    /// Executes committed on the destination and not yet recorded as finished.
    committed: Vec<String>,
}

impl ExecuteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one execute inside the batch transaction of `session`.
    pub async fn execute<D, S>(
        &mut self,
        session: &mut D,
        store: &S,
        queue: &str,
        request: &ExecuteRequest,
        tables: &TableMap,
    ) -> ReplicaResult<()>
    where
        D: DestinationSession + Send,
        S: StateStore,
    {
        if self.batch.contains(&request.name) {
            info!(name = %request.name, "execute already handled in this batch");
            return Ok(());
        }

        let attrs = ExecAttrs::parse(request.attrs.as_deref())?;

        session.set_replication_role(ReplicationRole::Local).await?;

        let status = store
            .register_execute(queue, &request.name, &request.sql, request.attrs.as_deref())
            .await?;
        if status.already_handled() {
            info!(name = %request.name, code = status.code(), "skipping execution of already handled execute");
            session.set_replication_role(ReplicationRole::Replica).await?;

            return Ok(());
        }

        let local_sequences = store.local_sequences(queue).await?;
        if attrs.need_execute(session, tables, &local_sequences).await? {
            info!(name = %request.name, "executing sql");

            let sql = attrs.process_sql(&request.sql, tables);
            for statement in split_statements(&sql) {
                debug!(name = %request.name, statement, "running execute statement");
                session.execute(&statement).await?;
            }
        } else {
            info!(name = %request.name, "execution not needed on this node");
        }

        self.batch.push(request.name.clone());
        session.set_replication_role(ReplicationRole::Replica).await?;

        Ok(())
    }

    /// Marks the executes of the batch as committed on the destination.
    pub fn commit_batch(&mut self) {
        self.committed.append(&mut self.batch);
    }

    /// Records every committed execute as finished.
    ///
    /// Executes whose record failed stay queued for the next call.
    pub async fn finish_committed<S>(&mut self, store: &S, queue: &str) -> ReplicaResult<()>
    where
        S: StateStore,
    {
        while let Some(name) = self.committed.first() {
            store.finish_execute(queue, name).await?;
            debug!(%name, "execute finished");
            self.committed.remove(0);
        }

        Ok(())
    }

    /// Records the executes of a batch found already committed on the destination.
    ///
    /// The worker may have stopped between the commit and the records, the batch is then
    /// redelivered and acked without being applied again.
    pub async fn finish_applied_batch<S>(
        &mut self,
        store: &S,
        queue: &str,
        events: &[Event],
    ) -> ReplicaResult<()>
    where
        S: StateStore,
    {
        self.finish_committed(store, queue).await?;

        for event in events.iter().filter(|event| event.kind == EventKind::Execute) {
            let Some(name) = &event.table_name else {
                continue;
            };

            let status = store
                .register_execute(queue, name, &event.payload, event.attrs.as_deref())
                .await?;
            if !status.already_handled() {
                store.finish_execute(queue, name).await?;
                info!(%name, "finished execute of an already applied batch");
            }
        }

        Ok(())
    }

    /// Forgets the executes of a failed batch.
    pub fn discard_batch(&mut self) {
        self.batch.clear();
    }

    /// Executes handled in the open batch.
    pub fn pending(&self) -> &[String] {
        &self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::destination::memory::MemoryDestination;
    use crate::state::table::{TableState, TableSyncPhase};
    use crate::store::state::MemoryStateStore;
    use crate::test_utils::event::execute;

    const QUEUE: &str = "replika";

    fn request(name: &str, sql: &str, attrs: Option<&str>) -> ExecuteRequest {
        ExecuteRequest {
            name: name.to_owned(),
            sql: sql.to_owned(),
            attrs: attrs.map(str::to_owned),
        }
    }

    #[test]
    fn attrs_select_nodes_and_rewrite_placeholders() {
        let tables = TableMap::new(vec![
            TableState::new("orders", Some("archive.Orders")).with_phase(TableSyncPhase::Ok),
        ]);

        let attrs = ExecAttrs::parse(Some("local_table=public.orders,public.items")).unwrap();
        assert!(attrs.is_local(&tables, &[]));
        assert_eq!(
            attrs.process_sql("alter table @public.orders@ add x int", &tables),
            "alter table archive.\"Orders\" add x int"
        );

        let attrs = ExecAttrs::parse(Some("local_table=items&local_sequence=orders_id_seq")).unwrap();
        assert!(!attrs.is_local(&tables, &[]));
        assert!(attrs.is_local(&tables, &["public.orders_id_seq".to_owned()]));

        assert!(ExecAttrs::parse(None).unwrap().is_unrestricted());
    }

    #[test]
    fn unknown_attrs_are_ignored() {
        let attrs = ExecAttrs::parse(Some("local_destination=x&local_table=orders")).unwrap();

        assert_eq!(attrs.local_tables, vec!["orders".to_owned()]);
        assert!(attrs.needed_objects.is_empty());
    }

    #[tokio::test]
    async fn needed_objects_must_all_exist() {
        let destination = MemoryDestination::new();
        destination.add_object(ObjectKind::Schema, "billing").await;
        destination.add_object(ObjectKind::Function, "billing.total").await;
        let mut session = destination.open_session().await.unwrap();
        let tables = TableMap::default();

        let attrs = ExecAttrs::parse(Some("need_schema=billing&need_function=billing.total")).unwrap();
        assert!(!attrs.is_unrestricted());
        assert!(attrs.need_execute(&mut session, &tables, &[]).await.unwrap());

        let attrs = ExecAttrs::parse(Some("need_schema=billing&need_view=billing.report")).unwrap();
        assert!(!attrs.need_execute(&mut session, &tables, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn executes_run_once_and_finish_after_commit() {
        let store = MemoryStateStore::new();
        let destination = MemoryDestination::new();
        let mut session = destination.open_session().await.unwrap();
        let mut coordinator = ExecuteCoordinator::new();
        let ddl = request(
            "0001.sql",
            "create table a (id int); create table b (id int);",
            None,
        );

        coordinator
            .execute(&mut session, &store, QUEUE, &ddl, &TableMap::default())
            .await
            .unwrap();
        assert_eq!(coordinator.pending(), ["0001.sql".to_owned()]);
        assert!(!store.execute_record(QUEUE, "0001.sql").await.unwrap().finished);

        coordinator.commit_batch();
        coordinator.finish_committed(&store, QUEUE).await.unwrap();
        assert!(coordinator.pending().is_empty());

        coordinator
            .execute(&mut session, &store, QUEUE, &ddl, &TableMap::default())
            .await
            .unwrap();
        assert!(coordinator.pending().is_empty());

        assert_eq!(
            destination.statements().await,
            vec!["create table a (id int)", "create table b (id int)"]
        );
        let record = store.execute_record(QUEUE, "0001.sql").await.unwrap();
        assert!(record.finished);
        assert_eq!(record.finish_count, 1);
        assert_eq!(
            destination.roles().await,
            vec![
                ReplicationRole::Replica,
                ReplicationRole::Local,
                ReplicationRole::Replica,
                ReplicationRole::Local,
                ReplicationRole::Replica,
            ]
        );
    }

    #[tokio::test]
    async fn discarded_batch_runs_its_execute_again() {
        let store = MemoryStateStore::new();
        let destination = MemoryDestination::new();
        let mut session = destination.open_session().await.unwrap();
        let mut coordinator = ExecuteCoordinator::new();
        let ddl = request("0003.sql", "alter table orders add note text", None);

        session.begin().await.unwrap();
        coordinator
            .execute(&mut session, &store, QUEUE, &ddl, &TableMap::default())
            .await
            .unwrap();
        session.rollback().await.unwrap();
        coordinator.discard_batch();

        session.begin().await.unwrap();
        coordinator
            .execute(&mut session, &store, QUEUE, &ddl, &TableMap::default())
            .await
            .unwrap();
        session.commit().await.unwrap();
        coordinator.commit_batch();
        coordinator.finish_committed(&store, QUEUE).await.unwrap();

        assert_eq!(
            destination.statements().await,
            vec!["alter table orders add note text"]
        );
        assert_eq!(
            store.execute_record(QUEUE, "0003.sql").await.unwrap().finish_count,
            1
        );
    }

    #[tokio::test]
    async fn applied_batch_finishes_its_open_executes() {
        let store = MemoryStateStore::new();
        let mut coordinator = ExecuteCoordinator::new();
        store
            .register_execute(QUEUE, "0004.sql", "drop table old", None)
            .await
            .unwrap();
        let events = vec![execute("0004.sql", "drop table old", None)];

        coordinator
            .finish_applied_batch(&store, QUEUE, &events)
            .await
            .unwrap();
        coordinator
            .finish_applied_batch(&store, QUEUE, &events)
            .await
            .unwrap();

        let record = store.execute_record(QUEUE, "0004.sql").await.unwrap();
        assert!(record.finished);
        assert_eq!(record.finish_count, 1);
    }

    #[tokio::test]
    async fn restricted_execute_is_skipped_but_finished() {
        let store = MemoryStateStore::new();
        let destination = MemoryDestination::new();
        let mut session = destination.open_session().await.unwrap();
        let mut coordinator = ExecuteCoordinator::new();

        coordinator
            .execute(
                &mut session,
                &store,
                QUEUE,
                &request("0002.sql", "drop table orders", Some("local_table=orders")),
                &TableMap::default(),
            )
            .await
            .unwrap();
        coordinator.commit_batch();
        coordinator.finish_committed(&store, QUEUE).await.unwrap();

        assert!(destination.statements().await.is_empty());
        assert!(store.execute_record(QUEUE, "0002.sql").await.unwrap().finished);
    }
}
