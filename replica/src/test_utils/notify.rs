use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::conversions::name::fq_name;
use crate::error::ReplicaResult;
use crate::state::table::{TableState, TableSyncPhaseType};
use crate::store::state::{ExecuteStatus, MemoryStateStore, StateStore};

#[derive(Debug)]
struct PhaseCondition {
    queue: String,
    table: String,
    phase: TableSyncPhaseType,
    notify: Arc<Notify>,
}

/// A [`MemoryStateStore`] that notifies waiters when a table reaches a phase.
#[derive(Debug, Clone)]
pub struct NotifyingStateStore {
    store: MemoryStateStore,
    conditions: Arc<Mutex<Vec<PhaseCondition>>>,
}

impl NotifyingStateStore {
    pub fn new() -> Self {
        Self {
            store: MemoryStateStore::new(),
            conditions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The wrapped store, for assertions on history and bookkeeping.
    pub fn inner(&self) -> &MemoryStateStore {
        &self.store
    }

    /// Returns a [`Notify`] fired once `table` of `queue` is persisted in `phase`.
    pub async fn notify_on_table_phase(
        &self,
        queue: &str,
        table: &str,
        phase: TableSyncPhaseType,
    ) -> Arc<Notify> {
        let table = fq_name(table);
        let notify = Arc::new(Notify::new());

        let mut conditions = self.conditions.lock().await;

        // The phase may already be reached or passed, the permit is then stored for the
        // waiter.
        let reached = self
            .store
            .phase_history(queue, &table)
            .await
            .iter()
            .any(|persisted| persisted.as_type() == phase);
        if reached {
            notify.notify_one();
            return notify;
        }

        conditions.push(PhaseCondition {
            queue: queue.to_owned(),
            table,
            phase,
            notify: notify.clone(),
        });

        notify
    }

    async fn check_conditions(&self, queue: &str, state: &TableState) {
        let mut conditions = self.conditions.lock().await;
        conditions.retain(|condition| {
            let reached = condition.queue == queue
                && condition.table == state.name
                && condition.phase == state.phase_type();
            if reached {
                condition.notify.notify_one();
            }

            !reached
        });
    }
}

impl Default for NotifyingStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for NotifyingStateStore {
    async fn load_states(&self, queue: &str) -> ReplicaResult<Vec<TableState>> {
        self.store.load_states(queue).await
    }

    async fn save_state(&self, queue: &str, state: &TableState) -> ReplicaResult<()> {
        self.store.save_state(queue, state).await?;
        self.check_conditions(queue, state).await;

        Ok(())
    }

    async fn register_table(&self, queue: &str, state: TableState) -> ReplicaResult<()> {
        let registered = state.clone();
        self.store.register_table(queue, state).await?;
        self.check_conditions(queue, &registered).await;

        Ok(())
    }

    async fn delete_state(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        self.store.delete_state(queue, table).await
    }

    async fn register_execute(
        &self,
        queue: &str,
        name: &str,
        sql: &str,
        attrs: Option<&str>,
    ) -> ReplicaResult<ExecuteStatus> {
        self.store.register_execute(queue, name, sql, attrs).await
    }

    async fn finish_execute(&self, queue: &str, name: &str) -> ReplicaResult<()> {
        self.store.finish_execute(queue, name).await
    }

    async fn add_global_table(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        self.store.add_global_table(queue, table).await
    }

    async fn remove_global_table(&self, queue: &str, table: &str) -> ReplicaResult<()> {
        self.store.remove_global_table(queue, table).await
    }

    async fn remove_global_seq(&self, queue: &str, seq: &str) -> ReplicaResult<()> {
        self.store.remove_global_seq(queue, seq).await
    }

    async fn local_sequences(&self, queue: &str) -> ReplicaResult<Vec<String>> {
        self.store.local_sequences(queue).await
    }
}
