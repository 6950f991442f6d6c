use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use replica::apply::{ApplyTarget, DirectApply};
use replica::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use replica::destination::memory::MemoryDestination;
use replica::handlers::HandlerRegistry;
use replica::replication::sync::attach_table;
use replica::state::table::{HandlerSpec, TableState, TableSyncPhase, TableSyncPhaseType};
use replica::store::state::StateStore;
use replica::test_utils::config::{TEST_QUEUE, test_worker_config};
use replica::test_utils::copy::MemoryCopyDelegate;
use replica::test_utils::notify::NotifyingStateStore;
use replica::transport::MemoryQueue;
use replica::workers::base::Worker;
use replica::workers::replication::{ReplicationWorker, ReplicationWorkerHandle};
use replica_config::shared::WorkerConfig;

/// Upper bound for every wait in the tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// In memory collaborators of one destination node.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub queue: MemoryQueue,
    pub store: NotifyingStateStore,
    pub destination: MemoryDestination,
    pub delegate: MemoryCopyDelegate,
    pub shutdown_tx: ShutdownTx,
}

impl TestNode {
    pub fn new() -> Self {
        let queue = MemoryQueue::new(TEST_QUEUE).with_idle_ticker();
        let destination = MemoryDestination::new();
        let delegate = MemoryCopyDelegate::new(queue.clone(), destination.clone());
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            queue,
            store: NotifyingStateStore::new(),
            destination,
            delegate,
            shutdown_tx,
        }
    }

    /// Attaches `table` the way an operator does, in `Missing` with the default handler.
    pub async fn attach(&self, table: &str) {
        attach_table(&self.store, TEST_QUEUE, table, None, HandlerSpec::default())
            .await
            .unwrap();
    }

    /// Registers `table` in `phase` directly in the state store.
    pub async fn register(&self, table: &str, phase: TableSyncPhase) {
        self.store
            .register_table(TEST_QUEUE, TableState::new(table, None).with_phase(phase))
            .await
            .unwrap();
    }

    pub async fn start(&self, max_parallel_copies: u16) -> ReplicationWorkerHandle {
        self.start_with(test_worker_config(max_parallel_copies), DirectApply)
            .await
    }

    pub async fn start_with<A>(&self, config: WorkerConfig, apply: A) -> ReplicationWorkerHandle
    where
        A: ApplyTarget,
    {
        ReplicationWorker::new(
            Arc::new(config),
            self.queue.clone(),
            self.store.clone(),
            self.destination.clone(),
            apply,
            self.delegate.clone(),
            Arc::new(HandlerRegistry::default()),
            self.shutdown_tx.clone(),
        )
        .start()
        .await
        .unwrap()
    }

    /// Waits until `table` is persisted in `phase`.
    pub async fn wait_for_phase(&self, table: &str, phase: TableSyncPhaseType) {
        let notify = self
            .store
            .notify_on_table_phase(TEST_QUEUE, table, phase)
            .await;

        tokio::time::timeout(WAIT_TIMEOUT, notify.notified())
            .await
            .unwrap_or_else(|_| panic!("{table} did not reach {phase}"));
    }

    pub async fn phase(&self, table: &str) -> Option<TableSyncPhase> {
        self.store
            .inner()
            .table_state(TEST_QUEUE, table)
            .await
            .map(|state| state.phase())
    }

    pub async fn phase_history(&self, table: &str) -> Vec<TableSyncPhaseType> {
        self.store
            .inner()
            .phase_history(TEST_QUEUE, table)
            .await
            .iter()
            .map(TableSyncPhase::as_type)
            .collect()
    }
}

/// Polls `condition` until it holds.
pub async fn wait_until<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waiting = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(WAIT_TIMEOUT, waiting)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
}

pub fn row(values: &[(&str, &str)]) -> replica::types::RowData {
    values
        .iter()
        .map(|(column, value)| (column.to_string(), Some(value.to_string())))
        .collect()
}
