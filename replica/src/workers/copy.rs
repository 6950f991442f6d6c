use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use replica_config::shared::WorkerConfig;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info};

use crate::apply::ApplyTarget;
use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::concurrency::signal::SignalTx;
use crate::destination::{Destination, DestinationSession};
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::HandlerRegistry;
use crate::metrics::REPLICA_COPY_FAILURES_TOTAL;
use crate::replica_error;
use crate::replication::apply::{
    ApplyLoopContext, ApplyLoopHook, ApplyLoopResult, ApplyLoopState, start_apply_loop,
};
use crate::replication::copy::{CopyDelegate, CopyRequest, report_copy_failure, restore_dropped_ddl};
use crate::replication::sync::{CopySyncCoordinator, CopySyncStep, SyncResult, save_table_state};
use crate::state::map::TableMap;
use crate::state::table::{TableState, TableSyncPhase};
use crate::store::state::StateStore;
use crate::transport::QueueTransport;
use crate::types::{BatchInfo, BatchWindow};
use crate::workers::base::{Worker, WorkerHandle, WorkerRole};
use crate::workers::pool::CopyWorkerPool;

/// Everything needed to start copy workers of one queue.
#[derive(Debug, Clone)]
pub struct CopyLauncher<T, S, D, A, C> {
    config: Arc<WorkerConfig>,
    transport: T,
    store: S,
    destination: D,
    apply: A,
    delegate: C,
    registry: Arc<HandlerRegistry>,
    pool: CopyWorkerPool,
    shutdown_rx: ShutdownRx,
    tables_changed_tx: SignalTx,
}

impl<T, S, D, A, C> CopyLauncher<T, S, D, A, C>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<WorkerConfig>,
        transport: T,
        store: S,
        destination: D,
        apply: A,
        delegate: C,
        registry: Arc<HandlerRegistry>,
        pool: CopyWorkerPool,
        shutdown_rx: ShutdownRx,
        tables_changed_tx: SignalTx,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            destination,
            apply,
            delegate,
            registry,
            pool,
            shutdown_rx,
            tables_changed_tx,
        }
    }

    /// Starts the copy worker of `table`. Returns `Ok(false)` if one is already running.
    pub async fn launch(&self, table: &str) -> ReplicaResult<bool> {
        let worker = CopyWorker {
            table: table.to_owned(),
            launcher: self.clone(),
        };

        self.pool.lock().await.start_worker(table, worker).await
    }
}

#[derive(Debug)]
pub struct CopyWorkerHandle {
    handle: Option<JoinHandle<ReplicaResult<()>>>,
}

impl CopyWorkerHandle {
    pub(crate) fn new(handle: JoinHandle<ReplicaResult<()>>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Returns `true` once the worker task ended, waiting on it does not block then.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl WorkerHandle for CopyWorkerHandle {
    async fn wait(mut self) -> ReplicaResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            replica_error!(
                ErrorKind::CopyWorkerPanic,
                "Copy worker task failed",
                err
            )
        })?
    }
}

/// Copies one table and replays its backlog until the main worker takes it over.
#[derive(Debug)]
pub struct CopyWorker<T, S, D, A, C> {
    table: String,
    launcher: CopyLauncher<T, S, D, A, C>,
}

impl<T, S, D, A, C> CopyWorker<T, S, D, A, C>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    async fn run(self) -> ReplicaResult<()> {
        let launcher = self.launcher;
        let role = WorkerRole::Copy {
            table: self.table.clone(),
        };
        let consumer = role.consumer_name(&launcher.config.consumer_name);

        let hook = CopyWorkerHook {
            sync: CopySyncCoordinator::new(
                &self.table,
                BatchWindow::from(&launcher.config.batch_window),
            ),
            role,
            queue: launcher.transport.queue_name().to_owned(),
            store: launcher.store.clone(),
            delegate: launcher.delegate.clone(),
            registry: launcher.registry.clone(),
            tables_changed_tx: launcher.tables_changed_tx.clone(),
        };
        let context = ApplyLoopContext {
            config: launcher.config.clone(),
            transport: launcher.transport.clone(),
            store: launcher.store.clone(),
            destination: launcher.destination.clone(),
            apply: launcher.apply.clone(),
            registry: launcher.registry.clone(),
        };

        let result = match start_apply_loop(context, hook, launcher.shutdown_rx.clone(), None).await {
            Ok(result) => result,
            // The table was detached while this worker still owned it.
            Err(err) if err.kind() == ErrorKind::TableNotFound => {
                info!(table = %self.table, error = %err, "copied table was detached, stopping copy worker");
                ApplyLoopResult::Completed
            }
            Err(err) => return Err(err),
        };
        if result == ApplyLoopResult::Completed {
            launcher.transport.unregister_consumer(&consumer).await?;
            info!(%consumer, "copy worker done, consumer unregistered");
        }

        Ok(())
    }
}

impl<T, S, D, A, C> Worker<CopyWorkerHandle> for CopyWorker<T, S, D, A, C>
where
    T: QueueTransport + Clone + Send + Sync + 'static,
    S: StateStore + Clone + Send + Sync + 'static,
    D: Destination,
    A: ApplyTarget,
    C: CopyDelegate,
{
    async fn start(self) -> ReplicaResult<CopyWorkerHandle> {
        info!(table = %self.table, "starting copy worker");

        let table = self.table.clone();
        let pool = self.launcher.pool.clone();
        let copy_worker_span = tracing::info_span!(
            "copy_worker",
            queue = %self.launcher.transport.queue_name(),
            table = %self.table
        );
        let copy_worker = self.run().instrument(copy_worker_span);

        // The pool is told about the end of the worker in any case, panics included.
        let copy_worker = async move {
            let result = match AssertUnwindSafe(copy_worker).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(replica_error!(
                    ErrorKind::CopyWorkerPanic,
                    "Copy worker panicked",
                    table
                )),
            };

            if let Err(err) = &result {
                error!(%table, error = %err, "copy worker failed");
            }

            pool.lock().await.mark_worker_finished(&table);

            result
        };

        Ok(CopyWorkerHandle::new(tokio::spawn(copy_worker)))
    }
}

#[derive(Debug)]
struct CopyWorkerHook<S, C> {
    role: WorkerRole,
    queue: String,
    store: S,
    delegate: C,
    registry: Arc<HandlerRegistry>,
    sync: CopySyncCoordinator,
    tables_changed_tx: SignalTx,
}

impl<S, C> CopyWorkerHook<S, C>
where
    S: StateStore + Send + Sync,
    C: CopyDelegate,
{
    fn own_table<'a>(&self, tables: &'a mut TableMap) -> ReplicaResult<&'a mut TableState> {
        let name = self.role.copy_table().unwrap_or_default();

        tables.get_mut(name).ok_or_else(|| {
            replica_error!(
                ErrorKind::TableNotFound,
                "Copied table is not registered",
                name
            )
        })
    }

    fn notify_main(&self) {
        if self.tables_changed_tx.send(()).is_err() {
            debug!("main worker is not listening for table changes");
        }
    }

    async fn copy_table(&self, table: &mut TableState) -> ReplicaResult<()> {
        let request = {
            let handler = self.registry.create(table)?;
            CopyRequest::for_table(&self.queue, table, handler.copy_condition())
        };

        info!(
            table = %table.name,
            dest_table = %table.dest_table,
            condition = request.condition.as_deref().unwrap_or_default(),
            "starting bulk copy"
        );

        let snapshot = match self.delegate.copy_table(&request).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                counter!(REPLICA_COPY_FAILURES_TOTAL).increment(1);
                report_copy_failure(table, &err);

                bail!(
                    ErrorKind::CopyFailed,
                    "Bulk copy failed",
                    format!("{}: {err}", table.name)
                );
            }
        };

        info!(table = %table.name, %snapshot, "bulk copy finished");

        table.snapshot = Some(snapshot);
        table.last_snapshot_tick = None;
        table.change_phase(TableSyncPhase::CatchingUp)?;
        save_table_state(&self.store, &self.queue, table).await?;
        self.notify_main();

        Ok(())
    }
}

impl<S, C> ApplyLoopHook for CopyWorkerHook<S, C>
where
    S: StateStore + Send + Sync,
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
        let step = self.sync.evaluate(&state.tables, batch, state.lagging)?;
        debug!(?step, tick_id = batch.tick_id, "copy worker sync step");

        let result = match step {
            CopySyncStep::Proceed => SyncResult::Proceed,
            CopySyncStep::Wait => SyncResult::Loop,
            CopySyncStep::Exit => SyncResult::Exit,
            CopySyncStep::StartCopy => {
                let table = self.own_table(&mut state.tables)?;
                self.copy_table(table).await?;
                state.lagging = true;

                SyncResult::Loop
            }
            CopySyncStep::RestoreDdl => {
                let table = self.own_table(&mut state.tables)?;
                restore_dropped_ddl(session, &self.store, &self.queue, table).await?;

                SyncResult::Proceed
            }
            CopySyncStep::RequestSync { sync_tick_id } => {
                let table = self.own_table(&mut state.tables)?;
                table.change_phase(TableSyncPhase::WannaSync { sync_tick_id })?;
                save_table_state(&self.store, &self.queue, table).await?;
                self.notify_main();

                SyncResult::Loop
            }
            CopySyncStep::Finish => {
                let table = self.own_table(&mut state.tables)?;
                table.change_phase(TableSyncPhase::Ok)?;
                save_table_state(&self.store, &self.queue, table).await?;
                self.notify_main();

                SyncResult::Exit
            }
        };

        Ok(result)
    }
}
