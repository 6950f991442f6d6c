use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use replica_config::shared::WorkerConfig;
use tracing::{debug, error, info, warn};

use crate::apply::ApplyTarget;
use crate::concurrency::shutdown::{ShutdownRx, shutdown_requested};
use crate::concurrency::signal::{SignalRx, signaled};
use crate::conversions::name::fq_name;
use crate::destination::{Destination, DestinationSession};
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::HandlerRegistry;
use crate::metrics::{REPLICA_BATCH_SIZE, REPLICA_EVENTS_APPLIED_TOTAL, ROLE_LABEL};
use crate::replica_error;
use crate::replication::copy::gc_snapshot;
use crate::replication::dispatch::{DispatchAction, EventDispatcher};
use crate::replication::execute::ExecuteCoordinator;
use crate::replication::sync::{SyncResult, detach_table, save_dirty_states};
use crate::state::map::TableMap;
use crate::store::state::StateStore;
use crate::transport::QueueTransport;
use crate::types::{Batch, BatchInfo, BatchWindow, ControlKind, Event};
use crate::workers::base::WorkerRole;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyLoopResult {
    /// The loop stopped on a shutdown request.
    Stopped,
    /// The hook decided that the worker has nothing left to do.
    Completed,
}

/// State shared between the apply loop and its hook.
#[derive(Debug)]
pub struct ApplyLoopState {
    pub tables: TableMap,
    /// `false` once a poll of the queue found no new batch, `true` again after a batch.
    pub lagging: bool,
}

/// Behavior that differs between the main worker and the copy workers.
pub trait ApplyLoopHook {
    fn role(&self) -> &WorkerRole;

    /// Window used to request the next batch.
    fn batch_window(&self) -> BatchWindow;

    /// Advances the table states before `batch` is processed.
    ///
    /// Called again with reloaded states, after a sleep, for as long as it returns
    /// [`SyncResult::Loop`].
    fn sync_tables<X>(
        &mut self,
        state: &mut ApplyLoopState,
        batch: &BatchInfo,
        session: &mut X,
    ) -> impl Future<Output = ReplicaResult<SyncResult>> + Send
    where
        X: DestinationSession + Send;
}

#[derive(Debug)]
enum StepOutcome {
    Idle,
    Applied,
    Completed,
    Shutdown,
}

/// Collaborators of an apply loop.
#[derive(Debug)]
pub struct ApplyLoopContext<T, S, D, A> {
    pub config: Arc<WorkerConfig>,
    pub transport: T,
    pub store: S,
    pub destination: D,
    pub apply: A,
    pub registry: Arc<HandlerRegistry>,
}

/// Runs the batch loop of a worker until shutdown or until the hook completes.
///
/// Every batch is processed in one destination transaction, together with the table
/// state bookkeeping and the completed tick of the consumer. The batch is acked on the
/// queue only after the commit; a batch redelivered after a commit is recognized through
/// the completed tick and acked without applying it again.
pub async fn start_apply_loop<T, S, D, A, H>(
    context: ApplyLoopContext<T, S, D, A>,
    hook: H,
    shutdown_rx: ShutdownRx,
    tables_changed_rx: Option<SignalRx>,
) -> ReplicaResult<ApplyLoopResult>
where
    T: QueueTransport + Send + Sync,
    S: StateStore + Send + Sync,
    D: Destination,
    A: ApplyTarget,
    H: ApplyLoopHook + Send,
{
    let role = hook.role().clone();
    let queue = context.transport.queue_name().to_owned();
    let consumer = role.consumer_name(&context.config.consumer_name);

    info!(%role, %queue, %consumer, "starting apply loop");

    let mut apply_loop = ApplyLoop {
        dispatcher: EventDispatcher::new(role.clone(), context.registry.clone()),
        role,
        queue,
        consumer,
        context,
        hook,
        executes: ExecuteCoordinator::new(),
        state: ApplyLoopState {
            tables: TableMap::default(),
            lagging: true,
        },
        session: None,
        shutdown_rx,
        tables_changed_rx,
    };

    apply_loop.run().await
}

struct ApplyLoop<T, S, D, A, H>
where
    D: Destination,
{
    role: WorkerRole,
    queue: String,
    consumer: String,
    context: ApplyLoopContext<T, S, D, A>,
    hook: H,
    dispatcher: EventDispatcher,
    executes: ExecuteCoordinator,
    state: ApplyLoopState,
    session: Option<D::Session>,
    shutdown_rx: ShutdownRx,
    tables_changed_rx: Option<SignalRx>,
}

impl<T, S, D, A, H> ApplyLoop<T, S, D, A, H>
where
    T: QueueTransport + Send + Sync,
    S: StateStore + Send + Sync,
    D: Destination,
    A: ApplyTarget,
    H: ApplyLoopHook + Send,
{
    async fn run(&mut self) -> ReplicaResult<ApplyLoopResult> {
        let mut attempt = 0;

        loop {
            if shutdown_requested(&self.shutdown_rx) {
                info!(role = %self.role, "shutting down apply loop");
                return Ok(ApplyLoopResult::Stopped);
            }

            match self.step().await {
                Ok(StepOutcome::Applied) => {
                    attempt = 0;
                }
                Ok(StepOutcome::Idle) => {
                    attempt = 0;
                    if self.sleep(self.context.config.loop_delay()).await {
                        return Ok(ApplyLoopResult::Stopped);
                    }
                }
                Ok(StepOutcome::Completed) => {
                    info!(role = %self.role, "apply loop completed");
                    return Ok(ApplyLoopResult::Completed);
                }
                Ok(StepOutcome::Shutdown) => {
                    info!(role = %self.role, "shutting down apply loop while syncing tables");
                    return Ok(ApplyLoopResult::Stopped);
                }
                Err(err) => {
                    self.abort_batch().await;

                    if !err.is_retryable() {
                        error!(role = %self.role, error = %err, "batch failed with a permanent error");
                        return Err(err);
                    }

                    attempt += 1;
                    let retry = &self.context.config.retry;
                    if retry.max_attempts.is_some_and(|max_attempts| attempt > max_attempts) {
                        error!(role = %self.role, attempt, error = %err, "batch failed, giving up");
                        return Err(err);
                    }

                    if err.requires_manual_intervention() {
                        error!(
                            role = %self.role,
                            attempt,
                            error = %err,
                            manual_intervention = true,
                            "batch failed after a partial external write, retrying"
                        );
                    } else {
                        warn!(role = %self.role, attempt, error = %err, "batch failed, retrying");
                    }

                    let delay = retry.delay_for_attempt(attempt);
                    if self.sleep(delay).await {
                        return Ok(ApplyLoopResult::Stopped);
                    }
                }
            }
        }
    }

    async fn step(&mut self) -> ReplicaResult<StepOutcome> {
        if self.session.is_none() {
            self.session = Some(self.context.destination.open_session().await?);
        }

        // Executes of an already committed batch whose records failed.
        self.executes
            .finish_committed(&self.context.store, &self.queue)
            .await?;

        let window = self.hook.batch_window();
        let Some(batch) = self
            .context
            .transport
            .next_batch(&self.consumer, &window)
            .await?
        else {
            debug!(role = %self.role, "no batch available");
            self.state.lagging = false;

            return Ok(StepOutcome::Idle);
        };

        let outcome = self.process_batch(&batch).await?;
        if let StepOutcome::Applied = outcome {
            self.state.lagging = true;
        }

        Ok(outcome)
    }

    async fn process_batch(&mut self, batch: &Batch) -> ReplicaResult<StepOutcome> {
        let Some(session) = self.session.as_mut() else {
            return Err(replica_error!(
                ErrorKind::InvalidState,
                "Batch processed without a destination session"
            ));
        };
        let info = batch.info;

        if let Some(completed_tick) = session.completed_tick(&self.consumer).await?
            && completed_tick >= info.tick_id
        {
            info!(
                role = %self.role,
                tick_id = info.tick_id,
                completed_tick,
                "batch already applied, acking it"
            );
            if !self.role.is_copy() {
                self.executes
                    .finish_applied_batch(&self.context.store, &self.queue, &batch.events)
                    .await?;
            }
            self.context.transport.ack(&self.consumer, &info).await?;

            return Ok(StepOutcome::Applied);
        }

        let loaded = self.context.store.load_states(&self.queue).await?;
        self.state.tables.reload(loaded);

        loop {
            if !self.role.is_copy() {
                self.state.tables.counter().record(&self.queue);
            }

            match self.hook.sync_tables(&mut self.state, &info, session).await? {
                SyncResult::Proceed => break,
                SyncResult::Exit => return Ok(StepOutcome::Completed),
                SyncResult::Loop => {
                    let poll_interval = self.context.config.sync_poll_interval();
                    if wait_for_tables(
                        &mut self.shutdown_rx,
                        self.tables_changed_rx.as_mut(),
                        poll_interval,
                    )
                    .await
                    {
                        return Ok(StepOutcome::Shutdown);
                    }

                    let loaded = self.context.store.load_states(&self.queue).await?;
                    self.state.tables.reload(loaded);
                }
            }
        }

        let no_lag = !self.state.lagging;
        for table in self.state.tables.iter_mut() {
            gc_snapshot(table, &self.role, &info, no_lag);
        }
        save_dirty_states(&self.context.store, &self.queue, &mut self.state.tables).await?;

        debug!(
            role = %self.role,
            batch_id = info.batch_id,
            prev_tick_id = info.prev_tick_id,
            tick_id = info.tick_id,
            events = batch.events.len(),
            "processing batch"
        );

        session.begin().await?;
        self.context.apply.begin_batch(&self.consumer, &info).await?;
        self.dispatcher.begin_batch(&info, &self.state.tables);

        let mut applied = 0u64;
        for event in &batch.events {
            applied += process_event(
                session,
                &self.context.store,
                &mut self.context.apply,
                &self.queue,
                &mut self.dispatcher,
                &mut self.executes,
                &mut self.state.tables,
                event,
            )
            .await
            .map_err(|err| err.with_context(event.context()))?;
        }

        self.dispatcher.finish_batch()?;
        self.context.apply.flush_batch(session).await?;
        save_dirty_states(&self.context.store, &self.queue, &mut self.state.tables).await?;
        session.set_completed_tick(&self.consumer, info.tick_id).await?;
        session.commit().await?;
        self.executes.commit_batch();

        self.executes
            .finish_committed(&self.context.store, &self.queue)
            .await?;
        self.context.transport.ack(&self.consumer, &info).await?;

        counter!(REPLICA_EVENTS_APPLIED_TOTAL, ROLE_LABEL => self.role.label()).increment(applied);
        gauge!(REPLICA_BATCH_SIZE, ROLE_LABEL => self.role.label()).set(batch.events.len() as f64);

        Ok(StepOutcome::Applied)
    }

    /// Cleans up after a failed batch. The session is dropped when the rollback fails.
    async fn abort_batch(&mut self) {
        self.dispatcher.abort_batch();
        self.executes.discard_batch();

        if let Some(session) = self.session.as_mut()
            && let Err(err) = session.rollback().await
        {
            warn!(role = %self.role, error = %err, "rollback failed, reopening the destination session");
            self.session = None;
        }
    }

    /// Sleeps for `duration`, returns `true` if shutdown was requested meanwhile.
    async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Waits for the next evaluation of the table states, returns `true` on shutdown.
async fn wait_for_tables(
    shutdown_rx: &mut ShutdownRx,
    tables_changed_rx: Option<&mut SignalRx>,
    poll_interval: Duration,
) -> bool {
    tokio::select! {
        biased;

        _ = shutdown_rx.changed() => true,

        // Copy workers signal their state changes so that the main worker does not have
        // to wait for the whole poll interval.
        _ = signaled(tables_changed_rx) => false,

        _ = tokio::time::sleep(poll_interval) => false,
    }
}

/// Handles one event, returns the number of changes applied.
async fn process_event<X, S, A>(
    session: &mut X,
    store: &S,
    apply: &mut A,
    queue: &str,
    dispatcher: &mut EventDispatcher,
    executes: &mut ExecuteCoordinator,
    tables: &mut TableMap,
    event: &Event,
) -> ReplicaResult<u64>
where
    X: DestinationSession + Send,
    S: StateStore + Sync,
    A: ApplyTarget,
{
    match dispatcher.dispatch(event, tables)? {
        DispatchAction::Apply(changes) => {
            let count = changes.len() as u64;
            for change in changes {
                apply.apply(session, change).await?;
            }

            Ok(count)
        }
        DispatchAction::Execute(request) => {
            executes
                .execute(session, store, queue, &request, tables)
                .await?;

            Ok(0)
        }
        DispatchAction::Control {
            kind,
            name,
            payload,
        } => {
            handle_control(session, store, queue, tables, kind, &name, &payload).await?;

            Ok(0)
        }
        DispatchAction::Ignored => Ok(0),
    }
}

/// Applies a change of the queue's replication set to this node.
async fn handle_control<X, S>(
    session: &mut X,
    store: &S,
    queue: &str,
    tables: &mut TableMap,
    kind: ControlKind,
    name: &str,
    payload: &str,
) -> ReplicaResult<()>
where
    X: DestinationSession + Send,
    S: StateStore + Sync,
{
    let name = fq_name(name);

    match kind {
        ControlKind::AddTable => {
            info!(table = %name, "table added to the queue");
            store.add_global_table(queue, &name).await?;
        }
        ControlKind::RemoveTable => {
            info!(table = %name, "table removed from the queue");
            store.remove_global_table(queue, &name).await?;
            if tables.remove(&name).is_some() {
                detach_table(store, queue, &name).await?;
            }
        }
        ControlKind::RemoveSeq => {
            info!(seq = %name, "sequence removed from the queue");
            store.remove_global_seq(queue, &name).await?;
        }
        ControlKind::UpdateSeq => {
            if store.local_sequences(queue).await?.contains(&name) {
                let value = payload.trim().parse::<i64>()?;
                debug!(seq = %name, value, "updating sequence");
                session.set_sequence(&name, value).await?;
            }
        }
    }

    Ok(())
}
