use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::destination::base::{
    Destination, DestinationSession, ForeignKey, ObjectKind, ReplicationRole,
};
use crate::error::{ErrorKind, ReplicaResult};
use crate::types::{ChangeOp, RowChange, RowData, TickId};

type RowKey = Vec<Option<String>>;

#[derive(Debug, Clone)]
enum StagedOp {
    Change(RowChange),
    Execute(String),
    DropForeignKey(String),
    SetSequence(String, i64),
    SetCompletedTick(String, TickId),
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<RowKey, RowData>>,
    /// Objects known to exist besides the tables holding rows.
    objects: HashSet<(ObjectKind, String)>,
    statements: Vec<String>,
    roles: Vec<ReplicationRole>,
    foreign_keys: Vec<ForeignKey>,
    dropped_foreign_keys: Vec<ForeignKey>,
    sequences: HashMap<String, i64>,
    completed_ticks: HashMap<String, TickId>,
    analyzed: Vec<String>,
    commits: usize,
    failing_applies: usize,
    failing_commits: usize,
}

impl Inner {
    fn check_apply(&mut self, change: &RowChange) -> ReplicaResult<()> {
        if self.failing_applies > 0 {
            self.failing_applies -= 1;
            bail!(
                ErrorKind::QueryFailed,
                "Injected destination failure",
                change.table
            );
        }

        Ok(())
    }

    fn apply(&mut self, op: StagedOp) -> ReplicaResult<()> {
        match op {
            StagedOp::Change(change) => self.apply_change(change)?,
            StagedOp::Execute(sql) => {
                if let Some(position) = self
                    .dropped_foreign_keys
                    .iter()
                    .position(|fk| fk.restore_sql == sql)
                {
                    let foreign_key = self.dropped_foreign_keys.remove(position);
                    self.foreign_keys.push(foreign_key);
                }
                self.statements.push(sql);
            }
            StagedOp::DropForeignKey(name) => {
                if let Some(position) = self.foreign_keys.iter().position(|fk| fk.name == name) {
                    let foreign_key = self.foreign_keys.remove(position);
                    self.dropped_foreign_keys.push(foreign_key);
                }
            }
            StagedOp::SetSequence(seq, value) => {
                self.sequences.insert(seq, value);
            }
            StagedOp::SetCompletedTick(consumer, tick_id) => {
                self.completed_ticks.insert(consumer, tick_id);
            }
        }

        Ok(())
    }

    fn apply_change(&mut self, change: RowChange) -> ReplicaResult<()> {
        let table = self.tables.entry(change.table.clone()).or_default();

        let key = if change.pkey_columns.is_empty() {
            change.row.values().cloned().collect()
        } else {
            change.pkey_values()
        };

        match change.op {
            ChangeOp::Insert => {
                if table.contains_key(&key) {
                    bail!(
                        ErrorKind::ConstraintViolation,
                        "Duplicate key on insert",
                        format!("{}: {:?}", change.table, key)
                    );
                }
                table.insert(key, change.row);
            }
            ChangeOp::Update => {
                let Some(row) = table.get_mut(&key) else {
                    debug!(table = %change.table, ?key, "update matched no row");
                    return Ok(());
                };
                row.extend(change.row);
            }
            ChangeOp::Delete => {
                table.remove(&key);
            }
            ChangeOp::Replace => {
                table.clear();
            }
        }

        Ok(())
    }
}

/// In memory [`Destination`].
///
/// Writes done inside a transaction are staged per session and only become visible on
/// commit.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Returns the committed rows of `table` ordered by key.
    pub async fn table_rows(&self, table: &str) -> Vec<RowData> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Replaces the content of `table`, keyed by `pkey_columns`.
    pub async fn replace_table_rows(&self, table: &str, pkey_columns: &[String], rows: Vec<RowData>) {
        let mut inner = self.inner.lock().await;
        let content = rows
            .into_iter()
            .map(|row| {
                let key = pkey_columns
                    .iter()
                    .map(|column| row.get(column).cloned().flatten())
                    .collect();
                (key, row)
            })
            .collect();

        inner.tables.insert(table.to_owned(), content);
    }

    /// Declares an object as existing in the destination.
    pub async fn add_object(&self, kind: ObjectKind, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.objects.insert((kind, kind.normalize(name)));
    }

    pub async fn add_foreign_key(&self, foreign_key: ForeignKey) {
        let mut inner = self.inner.lock().await;
        inner.foreign_keys.push(foreign_key);
    }

    pub async fn foreign_keys(&self) -> Vec<ForeignKey> {
        let inner = self.inner.lock().await;
        inner.foreign_keys.clone()
    }

    /// Returns committed statements in execution order.
    pub async fn statements(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.statements.clone()
    }

    /// Returns every replication role set on any session.
    pub async fn roles(&self) -> Vec<ReplicationRole> {
        let inner = self.inner.lock().await;
        inner.roles.clone()
    }

    pub async fn analyzed(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.analyzed.clone()
    }

    pub async fn sequence(&self, seq: &str) -> Option<i64> {
        let inner = self.inner.lock().await;
        inner.sequences.get(seq).copied()
    }

    pub async fn commits(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.commits
    }

    /// Makes the next `count` applied changes fail with a transient error.
    pub async fn fail_next_applies(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.failing_applies = count;
    }

    /// Makes the next `count` commits fail with a connection error, discarding the
    /// transaction.
    pub async fn fail_next_commits(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.failing_commits = count;
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl Destination for MemoryDestination {
    type Session = MemoryDestinationSession;

    async fn open_session(&self) -> ReplicaResult<Self::Session> {
        let mut inner = self.inner.lock().await;
        inner.roles.push(ReplicationRole::Replica);

        Ok(MemoryDestinationSession {
            inner: self.inner.clone(),
            staged: None,
        })
    }
}

#[derive(Debug)]
pub struct MemoryDestinationSession {
    inner: Arc<Mutex<Inner>>,
    /// Operations of the open transaction, `None` outside of a transaction.
    staged: Option<Vec<StagedOp>>,
}

impl MemoryDestinationSession {
    async fn stage(&mut self, op: StagedOp) -> ReplicaResult<()> {
        match self.staged.as_mut() {
            Some(staged) => {
                staged.push(op);
                Ok(())
            }
            None => {
                let mut inner = self.inner.lock().await;
                inner.apply(op)
            }
        }
    }
}

impl DestinationSession for MemoryDestinationSession {
    async fn begin(&mut self) -> ReplicaResult<()> {
        if self.staged.is_some() {
            bail!(ErrorKind::InvalidState, "Transaction already open");
        }
        self.staged = Some(Vec::new());

        Ok(())
    }

    async fn commit(&mut self) -> ReplicaResult<()> {
        let Some(staged) = self.staged.take() else {
            bail!(ErrorKind::InvalidState, "No transaction to commit");
        };

        let mut inner = self.inner.lock().await;
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            bail!(
                ErrorKind::ConnectionFailed,
                "Injected commit failure",
                format!("{} staged operations lost", staged.len())
            );
        }

        for op in staged {
            inner.apply(op)?;
        }
        inner.commits += 1;

        Ok(())
    }

    async fn rollback(&mut self) -> ReplicaResult<()> {
        if let Some(staged) = self.staged.take() {
            info!(discarded = staged.len(), "rolled back destination transaction");
        }

        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> ReplicaResult<()> {
        self.stage(StagedOp::Execute(sql.to_owned())).await
    }

    async fn apply_change(&mut self, change: &RowChange) -> ReplicaResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.check_apply(change)?;

            if change.op == ChangeOp::Insert
                && let Some(staged) = &self.staged
            {
                let key = change.pkey_values();
                let duplicate = inner
                    .tables
                    .get(&change.table)
                    .is_some_and(|rows| rows.contains_key(&key))
                    || staged.iter().any(|op| {
                        matches!(op, StagedOp::Change(other)
                            if other.table == change.table
                                && other.op == ChangeOp::Insert
                                && other.pkey_values() == key)
                    });
                if duplicate && !change.pkey_columns.is_empty() {
                    bail!(
                        ErrorKind::ConstraintViolation,
                        "Duplicate key on insert",
                        format!("{}: {:?}", change.table, key)
                    );
                }
            }
        }

        self.stage(StagedOp::Change(change.clone())).await
    }

    async fn set_replication_role(&mut self, role: ReplicationRole) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.roles.push(role);

        Ok(())
    }

    async fn table_foreign_keys(&mut self, table: &str) -> ReplicaResult<Vec<ForeignKey>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .foreign_keys
            .iter()
            .filter(|fk| fk.table == table || fk.referenced_table == table)
            .cloned()
            .collect())
    }

    async fn drop_foreign_key(&mut self, foreign_key: &ForeignKey) -> ReplicaResult<()> {
        self.stage(StagedOp::DropForeignKey(foreign_key.name.clone()))
            .await
    }

    async fn object_exists(&mut self, kind: ObjectKind, name: &str) -> ReplicaResult<bool> {
        let inner = self.inner.lock().await;
        let name = kind.normalize(name);

        Ok(inner.objects.contains(&(kind, name.clone()))
            || (kind == ObjectKind::Table && inner.tables.contains_key(&name)))
    }

    async fn analyze(&mut self, table: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.analyzed.push(table.to_owned());

        Ok(())
    }

    async fn set_sequence(&mut self, seq: &str, value: i64) -> ReplicaResult<()> {
        self.stage(StagedOp::SetSequence(seq.to_owned(), value)).await
    }

    async fn completed_tick(&mut self, consumer: &str) -> ReplicaResult<Option<TickId>> {
        let inner = self.inner.lock().await;

        Ok(inner.completed_ticks.get(consumer).copied())
    }

    async fn set_completed_tick(&mut self, consumer: &str, tick_id: TickId) -> ReplicaResult<()> {
        self.stage(StagedOp::SetCompletedTick(consumer.to_owned(), tick_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(table: &str, id: &str) -> RowChange {
        RowChange {
            event_id: 1,
            table: table.to_owned(),
            op: ChangeOp::Insert,
            pkey_columns: vec!["id".to_owned()],
            row: RowData::from([("id".to_owned(), Some(id.to_owned()))]),
        }
    }

    #[tokio::test]
    async fn staged_writes_are_visible_only_after_commit() {
        let destination = MemoryDestination::new();
        let mut session = destination.open_session().await.unwrap();

        session.begin().await.unwrap();
        session.apply_change(&insert("public.t", "1")).await.unwrap();
        assert!(destination.table_rows("public.t").await.is_empty());

        session.commit().await.unwrap();
        assert_eq!(destination.table_rows("public.t").await.len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let destination = MemoryDestination::new();
        let mut session = destination.open_session().await.unwrap();

        session.begin().await.unwrap();
        session.apply_change(&insert("public.t", "1")).await.unwrap();
        session.execute("create index on t (id)").await.unwrap();
        session.rollback().await.unwrap();

        assert!(destination.table_rows("public.t").await.is_empty());
        assert!(destination.statements().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_inserts_fail() {
        let destination = MemoryDestination::new();
        let mut session = destination.open_session().await.unwrap();

        session.begin().await.unwrap();
        session.apply_change(&insert("public.t", "1")).await.unwrap();
        let err = session.apply_change(&insert("public.t", "1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[tokio::test]
    async fn restore_statement_recreates_dropped_foreign_key() {
        let destination = MemoryDestination::new();
        let foreign_key = ForeignKey {
            name: "orders_customer_fkey".to_owned(),
            table: "public.orders".to_owned(),
            referenced_table: "public.customers".to_owned(),
            restore_sql: "alter table only public.orders add constraint orders_customer_fkey foreign key (customer_id) references public.customers(id)".to_owned(),
        };
        destination.add_foreign_key(foreign_key.clone()).await;

        let mut session = destination.open_session().await.unwrap();
        let found = session.table_foreign_keys("public.customers").await.unwrap();
        assert_eq!(found, vec![foreign_key.clone()]);

        session.drop_foreign_key(&foreign_key).await.unwrap();
        assert!(destination.foreign_keys().await.is_empty());

        session.execute(&foreign_key.restore_sql).await.unwrap();
        assert_eq!(destination.foreign_keys().await, vec![foreign_key]);
    }
}
