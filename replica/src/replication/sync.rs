use tracing::{error, info, warn};

use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};
use crate::state::map::TableMap;
use crate::state::table::{HandlerSpec, TableState, TableSyncPhase};
use crate::store::state::StateStore;
use crate::transport::ProviderTableStates;
use crate::types::{BatchInfo, BatchWindow, TickId};

/// Outcome of one evaluation of the table states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncResult {
    /// Process the current batch.
    Proceed,
    /// Wait for another worker, then evaluate again with reloaded states.
    Loop,
    /// Stop the worker, the batch is left unprocessed.
    Exit,
}

/// Batch window of a worker that can be shrunk to single tick batches.
///
/// Hand overs between the main and the copy worker happen on single tick batches so
/// that both see the same batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct WindowControl {
    configured: BatchWindow,
    /// Tick at which the window was shrunk.
    shrunk_at: Option<TickId>,
}

impl WindowControl {
    pub fn new(configured: BatchWindow) -> Self {
        Self {
            configured,
            shrunk_at: None,
        }
    }

    /// Window to request the next batch with.
    pub fn current(&self) -> BatchWindow {
        if self.shrunk_at.is_some() {
            BatchWindow::default()
        } else {
            self.configured
        }
    }

    /// Switches to single tick batches from `tick_id` on.
    pub fn shrink(&mut self, tick_id: TickId) {
        if self.configured.is_empty() || self.shrunk_at.is_some() {
            return;
        }

        info!(tick_id, "shrinking batch window to single ticks");
        self.shrunk_at = Some(tick_id);
    }

    pub fn restore(&mut self) {
        if let Some(tick_id) = self.shrunk_at.take() {
            info!(shrunk_at = tick_id, "restoring configured batch window");
        }
    }

    pub fn is_shrunk(&self) -> bool {
        self.shrunk_at.is_some()
    }

    /// Returns `true` if `batch` is known to contain a single tick.
    pub fn is_single_tick(&self, batch: &BatchInfo) -> bool {
        self.configured.is_empty()
            || self
                .shrunk_at
                .is_some_and(|tick_id| batch.prev_tick_id >= tick_id)
    }
}

/// State change requested by the main worker's evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainSyncAction {
    /// Let the copy worker finish at `sync_tick_id`.
    GrantSync { table: String, sync_tick_id: TickId },
    /// Start copying a table.
    LaunchCopy { table: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainSyncPlan {
    pub result: SyncResult,
    pub actions: Vec<MainSyncAction>,
}

/// Table state decisions taken by the main worker before each batch.
#[derive(Debug, Clone)]
pub struct MainSyncCoordinator {
    max_parallel_copies: u16,
    window: WindowControl,
}

impl MainSyncCoordinator {
    pub fn new(max_parallel_copies: u16, window: BatchWindow) -> Self {
        Self {
            max_parallel_copies,
            window: WindowControl::new(window),
        }
    }

    pub fn batch_window(&self) -> BatchWindow {
        self.window.current()
    }

    /// Decides what to do with the tables before processing `batch`.
    ///
    /// `provider` holds the phases of the tables on the provider node, `None` when this
    /// node replicates from the queue root.
    pub fn evaluate(
        &mut self,
        tables: &TableMap,
        batch: &BatchInfo,
        provider: Option<&ProviderTableStates>,
    ) -> MainSyncPlan {
        // A copy worker is finishing, the main worker must not move past its tick.
        if tables
            .iter()
            .any(|table| matches!(table.phase(), TableSyncPhase::DoSync { .. }))
        {
            return MainSyncPlan {
                result: SyncResult::Loop,
                actions: Vec::new(),
            };
        }

        let cur_tick = batch.tick_id;
        let sync_ok = self.window.is_single_tick(batch);

        let mut result = SyncResult::Proceed;
        let mut actions = Vec::new();
        let mut need_sync = false;

        for table in tables.iter() {
            let TableSyncPhase::WannaSync { sync_tick_id } = table.phase() else {
                continue;
            };
            if cur_tick < sync_tick_id {
                continue;
            }

            if sync_ok {
                actions.push(MainSyncAction::GrantSync {
                    table: table.name.clone(),
                    sync_tick_id: cur_tick,
                });
                result = SyncResult::Loop;
            } else {
                need_sync = true;
            }
        }

        if need_sync {
            self.window.shrink(cur_tick);
        } else {
            self.window.restore();
        }

        let mut capacity = tables.counter().copy_capacity(self.max_parallel_copies);
        for table in tables.iter() {
            if table.phase() != TableSyncPhase::Missing {
                continue;
            }
            if capacity == 0 {
                break;
            }

            if table.copy_node.is_none()
                && let Some(provider) = provider
            {
                match provider.get(&table.name) {
                    None => {
                        warn!(table = %table.name, "table is not available on the provider");
                        continue;
                    }
                    Some(phase) if *phase != TableSyncPhase::Ok => {
                        info!(table = %table.name, provider_phase = %phase, "table is not ready on the provider");
                        continue;
                    }
                    Some(_) => {}
                }
            }

            actions.push(MainSyncAction::LaunchCopy {
                table: table.name.clone(),
            });
            capacity -= 1;
            result = SyncResult::Loop;
        }

        MainSyncPlan { result, actions }
    }
}

/// Step decided by a copy worker for its table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopySyncStep {
    /// Replay the current batch.
    Proceed,
    /// Wait for the main worker.
    Wait,
    /// Run the bulk copy.
    StartCopy,
    /// Restore the statements dropped before the copy, then replay the batch.
    RestoreDdl,
    /// Ask the main worker to hand over at `sync_tick_id`.
    RequestSync { sync_tick_id: TickId },
    /// The main worker reached the hand over tick, the table is in sync.
    Finish,
    /// Nothing left for this worker.
    Exit,
}

/// Table state decisions taken by a copy worker before each batch.
#[derive(Debug, Clone)]
pub struct CopySyncCoordinator {
    table: String,
    window: WindowControl,
}

impl CopySyncCoordinator {
    pub fn new(table: &str, window: BatchWindow) -> Self {
        Self {
            table: table.to_owned(),
            window: WindowControl::new(window),
        }
    }

    pub fn batch_window(&self) -> BatchWindow {
        self.window.current()
    }

    /// Decides the next step for the copied table before processing `batch`.
    ///
    /// `lagging` is `true` while the last poll of the queue returned a batch.
    pub fn evaluate(
        &mut self,
        tables: &TableMap,
        batch: &BatchInfo,
        lagging: bool,
    ) -> ReplicaResult<CopySyncStep> {
        let Some(table) = tables.get(&self.table) else {
            error!(table = %self.table, "copied table was removed");
            return Ok(CopySyncStep::Exit);
        };

        let cur_tick = batch.tick_id;
        let step = match table.phase() {
            TableSyncPhase::DoSync { sync_tick_id } => {
                self.window.shrink(cur_tick);

                if cur_tick == sync_tick_id {
                    CopySyncStep::Finish
                } else if cur_tick < sync_tick_id {
                    CopySyncStep::Proceed
                } else {
                    bail!(
                        ErrorKind::InvalidState,
                        "Copy worker went past the hand over tick",
                        format!("{}: cur_tick={cur_tick} sync_tick={sync_tick_id}", table.name)
                    );
                }
            }
            TableSyncPhase::WannaSync { .. } => CopySyncStep::Wait,
            TableSyncPhase::CatchingUp => {
                if table.copy_role.is_some_and(|role| role.blocks_catch_up()) {
                    CopySyncStep::Wait
                } else if table.dropped_ddl.is_some() {
                    CopySyncStep::RestoreDdl
                } else if lagging {
                    CopySyncStep::Proceed
                } else if !self.window.is_single_tick(batch) {
                    self.window.shrink(cur_tick);
                    CopySyncStep::Proceed
                } else {
                    CopySyncStep::RequestSync {
                        sync_tick_id: cur_tick,
                    }
                }
            }
            TableSyncPhase::InCopy => CopySyncStep::StartCopy,
            phase @ (TableSyncPhase::Missing | TableSyncPhase::Ok) => {
                info!(table = %table.name, %phase, "table is not owned by the copy worker anymore");
                CopySyncStep::Exit
            }
        };

        Ok(step)
    }
}

/// Persists every dirty table state.
pub async fn save_dirty_states<S>(store: &S, queue: &str, tables: &mut TableMap) -> ReplicaResult<()>
where
    S: StateStore,
{
    for table in tables.iter_mut().filter(|table| table.is_dirty()) {
        save_table_state(store, queue, table).await?;
    }

    Ok(())
}

/// Persists one table state and marks it clean.
pub async fn save_table_state<S>(store: &S, queue: &str, table: &mut TableState) -> ReplicaResult<()>
where
    S: StateStore,
{
    info!(table = %table.name, phase = %table.phase(), "storing table state");
    store.save_state(queue, table).await?;
    table.mark_clean();

    Ok(())
}

/// Registers `table` on this node in [`TableSyncPhase::Missing`], the main worker
/// copies it once capacity allows.
pub async fn attach_table<S>(
    store: &S,
    queue: &str,
    table: &str,
    dest_table: Option<&str>,
    handler: HandlerSpec,
) -> ReplicaResult<()>
where
    S: StateStore,
{
    let state = TableState::new(table, dest_table).with_handler(handler);
    info!(table = %state.name, dest_table = %state.dest_table, "attaching table");

    store.register_table(queue, state).await
}

/// Removes `table` from this node. A copy worker of the table exits on its next pass.
pub async fn detach_table<S>(store: &S, queue: &str, table: &str) -> ReplicaResult<()>
where
    S: StateStore,
{
    let table = crate::conversions::name::fq_name(table);
    info!(%table, "detaching table");

    store.delete_state(queue, &table).await
}
