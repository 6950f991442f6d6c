use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::{HandlerRegistry, TableHandler};
use crate::metrics::{REPLICA_EVENTS_IGNORED_TOTAL, ROLE_LABEL};
use crate::replication::execute::ExecuteRequest;
use crate::state::map::TableMap;
use crate::state::table::{TableState, TableSyncPhase};
use crate::types::{
    BatchInfo, ChangeOp, ControlKind, Event, EventKind, RowChange, RowData, TickId,
};
use crate::workers::base::WorkerRole;

/// What has to happen for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    /// Changes to pass to the apply target, in order. May be empty when the handler
    /// filtered the event out.
    Apply(Vec<RowChange>),
    Execute(ExecuteRequest),
    Control {
        kind: ControlKind,
        /// Table or sequence named by the event.
        name: String,
        payload: String,
    },
    /// The event is not for this worker.
    Ignored,
}

/// Routes the events of a batch and drives the per table handlers.
///
/// Every handler touched during the lifetime of the dispatcher is prepared at most once
/// per batch, before the first event of its table, and finished once at the end of each
/// batch. Handler state is reset right after finishing.
#[derive(Debug)]
pub struct EventDispatcher {
    role: WorkerRole,
    registry: Arc<HandlerRegistry>,
    handlers: HashMap<String, Box<dyn TableHandler>>,
    prepared: HashSet<String>,
    batch: Option<BatchInfo>,
}

impl EventDispatcher {
    pub fn new(role: WorkerRole, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            role,
            registry,
            handlers: HashMap::new(),
            prepared: HashSet::new(),
            batch: None,
        }
    }

    /// Starts a batch. Handlers of tables that left `tables` are dropped.
    pub fn begin_batch(&mut self, batch: &BatchInfo, tables: &TableMap) {
        self.handlers.retain(|name, _| tables.get(name).is_some());
        self.prepared.clear();
        self.batch = Some(*batch);
    }

    /// Returns `true` if events of `table` at `tick_id` must be applied by this worker.
    ///
    /// The main worker owns tables in sync, a copy worker owns its own table while
    /// catching up. Events already contained in the copy snapshot are never applied.
    pub fn is_interesting(&self, table: &TableState, tick_id: TickId) -> bool {
        let owned = match &self.role {
            WorkerRole::Main => table.phase() == TableSyncPhase::Ok,
            WorkerRole::Copy { table: copy_table } => {
                table.name == *copy_table
                    && matches!(
                        table.phase(),
                        TableSyncPhase::CatchingUp | TableSyncPhase::DoSync { .. }
                    )
            }
        };

        owned && !table.is_covered_by_snapshot(tick_id)
    }

    pub fn dispatch(&mut self, event: &Event, tables: &TableMap) -> ReplicaResult<DispatchAction> {
        match &event.kind {
            EventKind::Insert | EventKind::Update | EventKind::Delete | EventKind::Truncate => {
                self.dispatch_row(event, tables)
            }
            EventKind::Execute => {
                if self.role.is_copy() {
                    return Ok(self.ignore(event));
                }

                let Some(name) = &event.table_name else {
                    bail!(ErrorKind::InvalidEvent, "Execute event without a name");
                };

                Ok(DispatchAction::Execute(ExecuteRequest {
                    name: name.clone(),
                    sql: event.payload.clone(),
                    attrs: event.attrs.clone(),
                }))
            }
            EventKind::Control(kind) => {
                if self.role.is_copy() {
                    return Ok(self.ignore(event));
                }

                let Some(name) = &event.table_name else {
                    bail!(
                        ErrorKind::InvalidEvent,
                        "Control event without a name",
                        kind.as_type()
                    );
                };

                Ok(DispatchAction::Control {
                    kind: *kind,
                    name: name.clone(),
                    payload: event.payload.clone(),
                })
            }
            EventKind::Unknown(ev_type) => {
                debug!(event_id = event.id, ev_type, "unknown event type");
                Ok(self.ignore(event))
            }
        }
    }

    fn dispatch_row(&mut self, event: &Event, tables: &TableMap) -> ReplicaResult<DispatchAction> {
        let Some(table_name) = &event.table_name else {
            bail!(ErrorKind::InvalidEvent, "Row event without a table");
        };

        let Some(table) = tables
            .get(table_name)
            .filter(|table| self.is_interesting(table, event.tick_id))
        else {
            return Ok(self.ignore(event));
        };

        let handler = self.handler_for(table)?;

        if event.kind == EventKind::Truncate {
            if handler.ignore_truncate() {
                info!(table = %table.dest_table, "ignoring truncate");
                return Ok(DispatchAction::Apply(Vec::new()));
            }

            return Ok(DispatchAction::Apply(vec![RowChange {
                event_id: event.id,
                table: table.dest_table.clone(),
                op: ChangeOp::Replace,
                pkey_columns: Vec::new(),
                row: RowData::new(),
            }]));
        }

        let mut changes = Vec::new();
        handler.process_event(event, &mut |change| changes.push(change))?;

        Ok(DispatchAction::Apply(changes))
    }

    /// Returns the handler of `table`, created on first use and prepared once per batch.
    fn handler_for(&mut self, table: &TableState) -> ReplicaResult<&mut dyn TableHandler> {
        let handler = match self.handlers.entry(table.name.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.registry.create(table)?),
        };

        if let Some(batch) = &self.batch
            && self.prepared.insert(table.name.clone())
        {
            handler.prepare_batch(batch)?;
        }

        Ok(handler.as_mut())
    }

    /// Finishes every known handler for the current batch and resets it.
    pub fn finish_batch(&mut self) -> ReplicaResult<()> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };

        for handler in self.handlers.values_mut() {
            handler.finish_batch(&batch)?;
            handler.reset();
        }
        self.prepared.clear();

        Ok(())
    }

    /// Resets every handler after a failed batch.
    pub fn abort_batch(&mut self) {
        for handler in self.handlers.values_mut() {
            handler.reset();
        }
        self.prepared.clear();
        self.batch = None;
    }

    fn ignore(&self, event: &Event) -> DispatchAction {
        debug!(event_id = event.id, tick_id = event.tick_id, "event ignored");
        counter!(REPLICA_EVENTS_IGNORED_TOTAL, ROLE_LABEL => self.role.label()).increment(1);

        DispatchAction::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::snapshot::CopySnapshot;
    use crate::state::table::HandlerSpec;

    fn batch(tick_id: i64) -> BatchInfo {
        BatchInfo {
            batch_id: tick_id,
            prev_tick_id: tick_id - 1,
            tick_id,
        }
    }

    fn row_event(id: i64, tick_id: i64, table: &str) -> Event {
        Event::from_queue(id, tick_id, "I:id", format!("id={id}"), Some(table.into()), None)
    }

    fn dispatcher(role: WorkerRole) -> EventDispatcher {
        EventDispatcher::new(role, Arc::new(HandlerRegistry::default()))
    }

    #[test]
    fn main_worker_applies_only_tables_in_sync() {
        let tables = TableMap::new(vec![
            TableState::new("orders", None).with_phase(TableSyncPhase::Ok),
            TableState::new("items", None).with_phase(TableSyncPhase::CatchingUp),
        ]);
        let mut dispatcher = dispatcher(WorkerRole::Main);
        dispatcher.begin_batch(&batch(5), &tables);

        let action = dispatcher
            .dispatch(&row_event(1, 5, "orders"), &tables)
            .unwrap();
        let DispatchAction::Apply(changes) = action else {
            panic!("expected changes, got {action:?}");
        };
        assert_eq!(changes[0].table, "public.orders");

        for table in ["items", "unknown"] {
            assert_eq!(
                dispatcher.dispatch(&row_event(2, 5, table), &tables).unwrap(),
                DispatchAction::Ignored
            );
        }
    }

    #[test]
    fn copy_worker_skips_events_inside_the_snapshot() {
        let mut items = TableState::new("items", None).with_phase(TableSyncPhase::CatchingUp);
        items.snapshot = Some(CopySnapshot::new(7));
        let tables = TableMap::new(vec![
            items,
            TableState::new("orders", None).with_phase(TableSyncPhase::CatchingUp),
        ]);
        let mut dispatcher = dispatcher(WorkerRole::Copy {
            table: "public.items".to_owned(),
        });
        dispatcher.begin_batch(&batch(8), &tables);

        assert_eq!(
            dispatcher.dispatch(&row_event(1, 7, "items"), &tables).unwrap(),
            DispatchAction::Ignored
        );
        assert!(matches!(
            dispatcher.dispatch(&row_event(2, 8, "items"), &tables).unwrap(),
            DispatchAction::Apply(changes) if changes.len() == 1
        ));
        assert_eq!(
            dispatcher.dispatch(&row_event(3, 8, "orders"), &tables).unwrap(),
            DispatchAction::Ignored
        );
    }

    #[test]
    fn truncate_becomes_replace_unless_ignored() {
        let tables = TableMap::new(vec![
            TableState::new("orders", Some("archive.orders")).with_phase(TableSyncPhase::Ok),
            TableState::new("items", None)
                .with_phase(TableSyncPhase::Ok)
                .with_handler(HandlerSpec::named("default").with_arg("ignore_truncate", "1")),
        ]);
        let mut dispatcher = dispatcher(WorkerRole::Main);
        dispatcher.begin_batch(&batch(3), &tables);

        let truncate = |table: &str| Event::from_queue(9, 3, "R", "", Some(table.into()), None);

        let DispatchAction::Apply(changes) = dispatcher.dispatch(&truncate("orders"), &tables).unwrap()
        else {
            panic!("expected changes");
        };
        assert_eq!(changes[0].op, ChangeOp::Replace);
        assert_eq!(changes[0].table, "archive.orders");

        assert_eq!(
            dispatcher.dispatch(&truncate("items"), &tables).unwrap(),
            DispatchAction::Apply(Vec::new())
        );
    }

    #[test]
    fn execute_and_control_events_belong_to_the_main_worker() {
        let tables = TableMap::default();
        let execute = Event::from_queue(
            1,
            2,
            "EXECUTE",
            "alter table orders add column note text",
            Some("0001_note.sql".into()),
            Some("local_table=public.orders".into()),
        );
        let control = Event::from_queue(2, 2, "londiste.add-table", "", Some("public.t".into()), None);

        let mut main = dispatcher(WorkerRole::Main);
        assert!(matches!(
            main.dispatch(&execute, &tables).unwrap(),
            DispatchAction::Execute(ExecuteRequest { ref name, .. }) if name == "0001_note.sql"
        ));
        assert!(matches!(
            main.dispatch(&control, &tables).unwrap(),
            DispatchAction::Control { kind: ControlKind::AddTable, .. }
        ));

        let mut copy = dispatcher(WorkerRole::Copy {
            table: "public.orders".to_owned(),
        });
        assert_eq!(copy.dispatch(&execute, &tables).unwrap(), DispatchAction::Ignored);
        assert_eq!(copy.dispatch(&control, &tables).unwrap(), DispatchAction::Ignored);
    }

    #[test]
    fn rows_without_table_are_invalid() {
        let event = Event::from_queue(1, 2, "I:id", "id=1", None, None);
        let err = dispatcher(WorkerRole::Main)
            .dispatch(&event, &TableMap::default())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidEvent);
    }
}
