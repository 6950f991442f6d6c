use std::sync::Arc;

use replica_config::shared::WorkerConfig;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::apply::ApplyTarget;
use crate::concurrency::shutdown::ShutdownTx;
use crate::concurrency::signal::create_signal;
use crate::destination::{Destination, DestinationSession};
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::HandlerRegistry;
use crate::metrics::register_metrics;
use crate::replica_error;
use crate::replication::apply::{ApplyLoopContext, ApplyLoopHook, ApplyLoopState, start_apply_loop};
use crate::replication::copy::{CopyDelegate, suspend_foreign_keys};
use crate::replication::sync::{MainSyncAction, MainSyncCoordinator, SyncResult, save_table_state};
use crate::state::table::{TableSyncPhase, TableSyncPhaseType};
use crate::store::state::StateStore;
use crate::transport::QueueTransport;
use crate::types::{BatchInfo, BatchWindow};
use crate::workers::base::{Worker, WorkerHandle, WorkerRole};
use crate::workers::copy::CopyLauncher;
use crate::workers::pool::CopyWorkerPool;

#[derive(Debug)]
pub struct ReplicationWorkerHandle {
    handle: Option<JoinHandle<ReplicaResult<()>>>,
    pool: CopyWorkerPool,
    shutdown_tx: ShutdownTx,
}

impl WorkerHandle for ReplicationWorkerHandle {
    /// Waits for the main worker, then for the copy workers.
    ///
    /// Copy worker failures are logged, the result is the one of the main worker.
    async fn wait(mut self) -> ReplicaResult<()> {
        let result = match self.handle.take() {
            Some(handle) => handle.await.map_err(|err| {
                replica_error!(ErrorKind::Unknown, "Replication worker task failed", err)
            })?,
            None => Ok(()),
        };

        if result.is_err() {
            // Copy workers would keep running without a main worker to hand over to.
            if let Err(err) = self.shutdown_tx.shutdown() {
                warn!("failed to stop copy workers: {err}");
            }
        }

        if let Err(err) = self.pool.wait_all().await {
            error!(error = %err, "copy workers failed");
        }

        result
    }
}

/// The main worker of a queue.
///
/// Replays the events of tables in sync, decides when tables get copied and hands tables
/// over from their copy workers.
#[derive(Debug)]
pub struct ReplicationWorker<T, S, D, A, C> {
    config: Arc<WorkerConfig>,
    transport: T,
    store: S,
    destination: D,
    apply: A,
    delegate: C,
    registry: Arc<HandlerRegistry>,
    pool: CopyWorkerPool,
    shutdown_tx: ShutdownTx,
}

impl<T, S, D, A, C> ReplicationWorker<T, S, D, A, C> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<WorkerConfig>,
        transport: T,
        store: S,
        destination: D,
        apply: A,
        delegate: C,
        registry: Arc<HandlerRegistry>,
        shutdown_tx: ShutdownTx,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            destination,
            apply,
            delegate,
            registry,
            pool: CopyWorkerPool::new(),
            shutdown_tx,
        }
    }

    pub fn pool(&self) -> &CopyWorkerPool {
        &self.pool
    }
}

impl<T, S, D, A, C> Worker<ReplicationWorkerHandle> for ReplicationWorker<T, S, D, A, C>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    async fn start(self) -> ReplicaResult<ReplicationWorkerHandle> {
        register_metrics();

        let queue = self.transport.queue_name().to_owned();
        info!(%queue, consumer = %self.config.consumer_name, "starting replication worker");

        self.transport
            .register_consumer(&self.config.consumer_name, None)
            .await?;

        let shutdown_rx = self.shutdown_tx.subscribe();
        let (tables_changed_tx, tables_changed_rx) = create_signal();
        let launcher = CopyLauncher::new(
            self.config.clone(),
            self.transport.clone(),
            self.store.clone(),
            self.destination.clone(),
            self.apply.clone(),
            self.delegate.clone(),
            self.registry.clone(),
            self.pool.clone(),
            shutdown_rx.clone(),
            tables_changed_tx,
        );

        if self.config.resume_copies_on_start {
            resume_copies(&self.store, &queue, &launcher).await?;
        }

        let hook = MainWorkerHook {
            role: WorkerRole::Main,
            queue: queue.clone(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
            launcher,
            sync: MainSyncCoordinator::new(
                self.config.max_parallel_copies,
                BatchWindow::from(&self.config.batch_window),
            ),
        };
        let context = ApplyLoopContext {
            config: self.config.clone(),
            transport: self.transport,
            store: self.store,
            destination: self.destination,
            apply: self.apply,
            registry: self.registry,
        };

        let replication_worker_span = tracing::info_span!(
            "replication_worker",
            %queue,
            consumer = %self.config.consumer_name
        );
        let replication_worker = async move {
            start_apply_loop(context, hook, shutdown_rx, Some(tables_changed_rx)).await?;

            Ok(())
        }
        .instrument(replication_worker_span);

        let handle = tokio::spawn(replication_worker);

        Ok(ReplicationWorkerHandle {
            handle: Some(handle),
            pool: self.pool,
            shutdown_tx: self.shutdown_tx,
        })
    }
}

/// Restarts the copy workers of tables whose bulk copy already finished.
async fn resume_copies<T, S, D, A, C>(
    store: &S,
    queue: &str,
    launcher: &CopyLauncher<T, S, D, A, C>,
) -> ReplicaResult<()>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    for table in store.load_states(queue).await? {
        match table.phase_type() {
            TableSyncPhaseType::CatchingUp
            | TableSyncPhaseType::WannaSync
            | TableSyncPhaseType::DoSync => {
                info!(table = %table.name, phase = %table.phase(), "resuming copy worker");
                launcher.launch(&table.name).await?;
            }
            TableSyncPhaseType::InCopy => {
                warn!(
                    table = %table.name,
                    manual_intervention = true,
                    "table was left in copy, it has to be re-attached"
                );
            }
            TableSyncPhaseType::Missing | TableSyncPhaseType::Ok => {}
        }
    }

    Ok(())
}

#[derive(Debug)]
struct MainWorkerHook<T, S, D, A, C> {
    role: WorkerRole,
    queue: String,
    config: Arc<WorkerConfig>,
    transport: T,
    store: S,
    launcher: CopyLauncher<T, S, D, A, C>,
    sync: MainSyncCoordinator,
}

impl<T, S, D, A, C> MainWorkerHook<T, S, D, A, C>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    /// Prepares `table` for its copy and starts the copy worker.
    ///
    /// The copy consumer starts at the beginning of the batch being processed: the main
    /// worker skips the table's events of this batch from now on.
    async fn launch_copy<X>(
        &self,
        state: &mut ApplyLoopState,
        table: &str,
        batch: &BatchInfo,
        session: &mut X,
    ) -> ReplicaResult<()>
    where
        X: DestinationSession + Send,
    {
        let Some(table) = state.tables.get_mut(table) else {
            return Err(replica_error!(
                ErrorKind::TableNotFound,
                "Table to copy is not registered",
                table
            ));
        };

        suspend_foreign_keys(session, &self.store, &self.queue, table).await?;

        let consumer = WorkerRole::Copy {
            table: table.name.clone(),
        }
        .consumer_name(&self.config.consumer_name);
        self.transport.unregister_consumer(&consumer).await?;
        self.transport
            .register_consumer(&consumer, Some(batch.prev_tick_id))
            .await?;

        table.change_phase(TableSyncPhase::InCopy)?;
        save_table_state(&self.store, &self.queue, table).await?;

        info!(table = %table.name, %consumer, at_tick = batch.prev_tick_id, "launching copy");
        self.launcher.launch(&table.name).await?;

        Ok(())
    }
}

impl<T, S, D, A, C> ApplyLoopHook for MainWorkerHook<T, S, D, A, C>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    fn role(&self) -> &WorkerRole {
        &self.role
    }

    fn batch_window(&self) -> BatchWindow {
        self.sync.batch_window()
    }

    async fn sync_tables<X>(
        &mut self,
        state: &mut ApplyLoopState,
        batch: &BatchInfo,
        session: &mut X,
    ) -> ReplicaResult<SyncResult>
    where
        X: DestinationSession + Send,
    {
        let needs_provider = state
            .tables
            .iter()
            .any(|table| table.phase() == TableSyncPhase::Missing && table.copy_node.is_none());
        let provider = if needs_provider {
            self.transport.provider_table_states().await?
        } else {
            None
        };

        let plan = self.sync.evaluate(&state.tables, batch, provider.as_ref());
        debug!(result = ?plan.result, actions = plan.actions.len(), "main worker sync pass");

        for action in plan.actions {
            match action {
                MainSyncAction::GrantSync {
                    table,
                    sync_tick_id,
                } => {
                    let Some(table) = state.tables.get_mut(&table) else {
                        continue;
                    };

                    table.change_phase(TableSyncPhase::DoSync { sync_tick_id })?;
                    save_table_state(&self.store, &self.queue, table).await?;
                }
                MainSyncAction::LaunchCopy { table } => {
                    self.launch_copy(state, &table, batch, session).await?;
                }
            }
        }

        Ok(plan.result)
    }
}
