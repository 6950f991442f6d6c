use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::conversions::name::fq_name;
use crate::error::{ErrorKind, ReplicaResult};
use crate::state::table::{TableState, TableSyncPhase};
use crate::store::state::{ExecuteStatus, StateStore};

/// Registration of an execute event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRecord {
    pub sql: String,
    pub attrs: Option<String>,
    pub finished: bool,
    pub finish_count: u32,
}

#[derive(Debug, Default)]
struct QueueInner {
    tables: Vec<TableState>,
    phase_history: HashMap<String, Vec<TableSyncPhase>>,
    executes: HashMap<String, ExecuteRecord>,
    global_tables: BTreeSet<String>,
    global_seqs: BTreeSet<String>,
    local_seqs: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueInner>,
}

impl Inner {
    fn queue(&mut self, queue: &str) -> &mut QueueInner {
        self.queues.entry(queue.to_owned()).or_default()
    }
}

/// In memory [`StateStore`] keeping a history of every persisted phase.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Returns every phase persisted for `table`, oldest first.
    pub async fn phase_history(&self, queue: &str, table: &str) -> Vec<TableSyncPhase> {
        let mut inner = self.inner.lock().await;
        inner
            .queue(queue)
            .phase_history
            .get(&fq_name(table))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn table_state(&self, queue: &str, table: &str) -> Option<TableState> {
        let table = fq_name(table);
        let mut inner = self.inner.lock().await;
        inner
            .queue(queue)
            .tables
            .iter()
            .find(|state| state.name == table)
            .cloned()
    }

    pub async fn execute_record(&self, queue: &str, name: &str) -> Option<ExecuteRecord> {
        let mut inner = self.inner.lock().await;
        inner.queue(queue).executes.get(name).cloned()
    }

    pub async fn global_tables(&self, queue: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.queue(queue).global_tables.iter().cloned().collect()
    }

    pub async fn global_seqs(&self, queue: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.queue(queue).global_seqs.iter().cloned().collect()
    }

    /// Marks `seq` as replicated to this node.
    pub async fn add_local_sequence(&self, queue: &str, seq: &str) {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(queue);
        queue.global_seqs.insert(seq.to_owned());
        queue.local_seqs.insert(seq.to_owned());
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    async fn load_states(&self, queue: &str) -> ReplicaResult<Vec<TableState>> {
        let mut inner = self.inner.lock().await;

        Ok(inner.queue(queue).tables.clone())
    }

    async fn save_state(&self, queue: &str, state: &TableState) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(queue);

        let Some(stored) = queue.tables.iter_mut().find(|t| t.name == state.name) else {
            bail!(
                ErrorKind::TableNotFound,
                "Table is not registered on this node",
                state.name
            );
        };

        let mut saved = state.clone();
        saved.mark_clean();
        saved.last_snapshot_tick = None;

        if stored.phase() != saved.phase() {
            queue
                .phase_history
                .entry(state.name.clone())
                .or_default()
                .push(saved.phase());
        }

        *stored = saved;

        Ok(())
    }

    async fn register_table(&self, queue: &str, state: TableState) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(queue);

        if queue.tables.iter().any(|t| t.name == state.name) {
            bail!(
                ErrorKind::InvalidState,
                "Table is already registered on this node",
                state.name
            );
        }

        queue
            .phase_history
            .insert(state.name.clone(), vec![state.phase()]);
        queue.global_tables.insert(state.name.clone());
        queue.tables.push(state);

        Ok(())
    }

    async fn delete_state(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.queue(queue).tables.retain(|t| t.name != table);

        Ok(())
    }

    async fn register_execute(
        &self,
        queue: &str,
        name: &str,
        sql: &str,
        attrs: Option<&str>,
    ) -> ReplicaResult<ExecuteStatus> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(queue);

        if let Some(record) = queue.executes.get(name)
            && record.finished
        {
            return Ok(ExecuteStatus::ALREADY_APPLIED);
        }

        queue.executes.insert(
            name.to_owned(),
            ExecuteRecord {
                sql: sql.to_owned(),
                attrs: attrs.map(str::to_owned),
                finished: false,
                finish_count: 0,
            },
        );

        Ok(ExecuteStatus::EXECUTE)
    }

    async fn finish_execute(&self, queue: &str, name: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.queue(queue).executes.get_mut(name) else {
            bail!(
                ErrorKind::InvalidState,
                "Execute event was never registered",
                name
            );
        };

        record.finished = true;
        record.finish_count += 1;

        Ok(())
    }

    async fn add_global_table(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.queue(queue).global_tables.insert(table.to_owned());

        Ok(())
    }

    async fn remove_global_table(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.queue(queue).global_tables.remove(table);

        Ok(())
    }

    async fn remove_global_seq(&self, queue: &str, seq: &str) -> ReplicaResult<()> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queue(queue);
        queue.global_seqs.remove(seq);
        queue.local_seqs.remove(seq);

        Ok(())
    }

    async fn local_sequences(&self, queue: &str) -> ReplicaResult<Vec<String>> {
        let mut inner = self.inner.lock().await;

        Ok(inner.queue(queue).local_seqs.iter().cloned().collect())
    }
}
