use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::bail;
use crate::conversions::name::fq_name;
use crate::error::{ErrorKind, ReplicaResult};
use crate::state::snapshot::CopySnapshot;
use crate::types::TickId;

/// Synchronization phase of a table on this node.
///
/// A table moves through the phases in order and never goes back:
/// `Missing -> InCopy -> CatchingUp -> WannaSync -> DoSync -> Ok`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TableSyncPhase {
    /// Registered on this node, no data copied yet.
    Missing,

    /// Set by the main worker right before launching the copy worker.
    InCopy,

    /// Set by the copy worker when the bulk copy finished. The copy worker now
    /// replays the events accumulated since the copy snapshot.
    CatchingUp,

    /// Set by the copy worker once the backlog is drained. The copy worker waits for the
    /// main worker to reach `sync_tick_id`.
    WannaSync { sync_tick_id: TickId },

    /// Set by the main worker when its position reached the requested tick. The copy
    /// worker replays up to `sync_tick_id` and hands the table over.
    DoSync { sync_tick_id: TickId },

    /// Replicated by the main worker.
    Ok,
}

impl TableSyncPhase {
    pub fn as_type(&self) -> TableSyncPhaseType {
        self.into()
    }

    /// Tick requested by the handshake phases.
    pub fn sync_tick_id(&self) -> Option<TickId> {
        match self {
            Self::WannaSync { sync_tick_id } | Self::DoSync { sync_tick_id } => Some(*sync_tick_id),
            _ => None,
        }
    }

    /// Renders the phase in its persisted form. `Missing` has no persisted value.
    pub fn to_storage(&self) -> Option<String> {
        match self {
            Self::Missing => None,
            Self::InCopy => Some("in-copy".to_owned()),
            Self::CatchingUp => Some("catching-up".to_owned()),
            Self::WannaSync { sync_tick_id } => Some(format!("wanna-sync:{sync_tick_id}")),
            Self::DoSync { sync_tick_id } => Some(format!("do-sync:{sync_tick_id}")),
            Self::Ok => Some("ok".to_owned()),
        }
    }

    /// Parses the persisted form produced by [`TableSyncPhase::to_storage`].
    pub fn from_storage(value: Option<&str>) -> ReplicaResult<TableSyncPhase> {
        let Some(value) = value else {
            return Ok(Self::Missing);
        };

        let phase = match value.split_once(':') {
            None => match value {
                "in-copy" => Self::InCopy,
                "catching-up" => Self::CatchingUp,
                "ok" => Self::Ok,
                other => bail!(ErrorKind::InvalidData, "Unknown table state", other),
            },
            Some((name, tick)) => {
                let sync_tick_id = tick.parse::<TickId>()?;
                match name {
                    "wanna-sync" => Self::WannaSync { sync_tick_id },
                    "do-sync" => Self::DoSync { sync_tick_id },
                    _ => bail!(ErrorKind::InvalidData, "Unknown table state", value),
                }
            }
        };

        Ok(phase)
    }

    /// Returns `true` if a table may move from `self` to `next`.
    ///
    /// Staying in the same handshake phase is allowed as long as the requested tick
    /// does not go backwards.
    pub fn can_transition_to(&self, next: &TableSyncPhase) -> bool {
        use TableSyncPhase::*;

        match (self, next) {
            (Missing, InCopy)
            | (InCopy, CatchingUp)
            | (CatchingUp, WannaSync { .. })
            | (WannaSync { .. }, DoSync { .. })
            | (DoSync { .. }, Ok) => true,
            (WannaSync { sync_tick_id: a }, WannaSync { sync_tick_id: b })
            | (DoSync { sync_tick_id: a }, DoSync { sync_tick_id: b }) => b >= a,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for TableSyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_storage() {
            Some(value) => f.write_str(&value),
            None => f.write_str("missing"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TableSyncPhaseType {
    Missing,
    InCopy,
    CatchingUp,
    WannaSync,
    DoSync,
    Ok,
}

impl TableSyncPhaseType {
    pub const ALL: [TableSyncPhaseType; 6] = [
        Self::Missing,
        Self::InCopy,
        Self::CatchingUp,
        Self::WannaSync,
        Self::DoSync,
        Self::Ok,
    ];

    /// Returns `true` while a copy worker owns the table.
    pub fn is_copy_owned(&self) -> bool {
        matches!(
            self,
            Self::InCopy | Self::CatchingUp | Self::WannaSync | Self::DoSync
        )
    }
}

impl<'a> From<&'a TableSyncPhase> for TableSyncPhaseType {
    fn from(phase: &'a TableSyncPhase) -> Self {
        match phase {
            TableSyncPhase::Missing => Self::Missing,
            TableSyncPhase::InCopy => Self::InCopy,
            TableSyncPhase::CatchingUp => Self::CatchingUp,
            TableSyncPhase::WannaSync { .. } => Self::WannaSync,
            TableSyncPhase::DoSync { .. } => Self::DoSync,
            TableSyncPhase::Ok => Self::Ok,
        }
    }
}

impl fmt::Display for TableSyncPhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::InCopy => write!(f, "in_copy"),
            Self::CatchingUp => write!(f, "catching_up"),
            Self::WannaSync => write!(f, "wanna_sync"),
            Self::DoSync => write!(f, "do_sync"),
            Self::Ok => write!(f, "ok"),
        }
    }
}

/// Role of a table in a partition merge copy.
///
/// The merge leader and the tables replaying for it hold back the catch-up hand over
/// until the other partitions caught up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CopyRole {
    Lead,
    WaitCopy,
    WaitReplay,
}

impl CopyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::WaitCopy => "wait-copy",
            Self::WaitReplay => "wait-replay",
        }
    }

    pub fn parse(value: &str) -> ReplicaResult<CopyRole> {
        match value {
            "lead" => Ok(Self::Lead),
            "wait-copy" => Ok(Self::WaitCopy),
            "wait-replay" => Ok(Self::WaitReplay),
            other => bail!(ErrorKind::InvalidData, "Unknown copy role", other),
        }
    }

    /// Returns `true` when the role keeps the copy worker in `CatchingUp`.
    pub fn blocks_catch_up(&self) -> bool {
        matches!(self, Self::Lead | Self::WaitReplay)
    }
}

/// Handler selected for a table and its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerSpec {
    pub name: Option<String>,
    pub args: BTreeMap<String, String>,
}

impl HandlerSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Synchronization record of one table of a queue on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    /// Fully qualified source table name.
    pub name: String,
    /// Fully qualified destination table name.
    pub dest_table: String,
    phase: TableSyncPhase,
    /// Tick at which the bulk copy was taken.
    pub snapshot: Option<CopySnapshot>,
    pub copy_role: Option<CopyRole>,
    /// Node to copy from instead of the provider, skips the provider state check.
    pub copy_node: Option<String>,
    /// Statements to run once the table caught up, e.g. dropped foreign keys.
    pub dropped_ddl: Option<String>,
    pub handler: HandlerSpec,
    /// Not persisted: first tick seen without lag while a snapshot is kept.
    pub last_snapshot_tick: Option<TickId>,
    dirty: bool,
}

impl TableState {
    /// Creates the record of a newly attached table in [`TableSyncPhase::Missing`].
    pub fn new(name: &str, dest_table: Option<&str>) -> TableState {
        let name = fq_name(name);
        let dest_table = dest_table.map(fq_name).unwrap_or_else(|| name.clone());

        TableState {
            name,
            dest_table,
            phase: TableSyncPhase::Missing,
            snapshot: None,
            copy_role: None,
            copy_node: None,
            dropped_ddl: None,
            handler: HandlerSpec::default(),
            last_snapshot_tick: None,
            dirty: false,
        }
    }

    /// Sets the phase of a record loaded from storage without transition checks.
    pub fn with_phase(mut self, phase: TableSyncPhase) -> TableState {
        self.phase = phase;
        self
    }

    pub fn with_handler(mut self, handler: HandlerSpec) -> TableState {
        self.handler = handler;
        self
    }

    pub fn phase(&self) -> TableSyncPhase {
        self.phase
    }

    pub fn phase_type(&self) -> TableSyncPhaseType {
        self.phase.as_type()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Moves the table to `phase`, failing on transitions outside the phase graph.
    pub fn change_phase(&mut self, phase: TableSyncPhase) -> ReplicaResult<()> {
        if !self.phase.can_transition_to(&phase) {
            bail!(
                ErrorKind::InvalidState,
                "Invalid table phase transition",
                format!("{}: {} -> {}", self.name, self.phase, phase)
            );
        }

        info!(table = %self.name, from = %self.phase, to = %phase, "table phase changed");

        self.phase = phase;
        self.dirty = true;

        Ok(())
    }

    /// Returns `true` if the copy snapshot already contains events of `tick_id`.
    pub fn is_covered_by_snapshot(&self, tick_id: TickId) -> bool {
        self.snapshot
            .is_some_and(|snapshot| snapshot.covers(tick_id))
    }

    /// Copies the persisted fields of `loaded` while keeping in-memory bookkeeping.
    pub fn refresh_from(&mut self, loaded: TableState) {
        let last_snapshot_tick = self.last_snapshot_tick;
        *self = loaded;
        self.last_snapshot_tick = last_snapshot_tick;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_form_round_trips_handshake_ticks() {
        let phase = TableSyncPhase::from_storage(Some("wanna-sync:42")).unwrap();
        assert_eq!(phase, TableSyncPhase::WannaSync { sync_tick_id: 42 });
        assert_eq!(phase.to_storage().as_deref(), Some("wanna-sync:42"));

        assert_eq!(TableSyncPhase::from_storage(None).unwrap(), TableSyncPhase::Missing);
        assert_eq!(TableSyncPhase::Missing.to_storage(), None);
    }

    #[test]
    fn unknown_storage_values_are_rejected() {
        assert_eq!(
            TableSyncPhase::from_storage(Some("copying")).unwrap_err().kind(),
            ErrorKind::InvalidData
        );
        assert_eq!(
            TableSyncPhase::from_storage(Some("do-sync:abc")).unwrap_err().kind(),
            ErrorKind::ConversionError
        );
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        let mut table = TableState::new("orders", None);
        assert_eq!(table.dest_table, "public.orders");

        table.change_phase(TableSyncPhase::InCopy).unwrap();
        table.change_phase(TableSyncPhase::CatchingUp).unwrap();
        table
            .change_phase(TableSyncPhase::WannaSync { sync_tick_id: 5 })
            .unwrap();
        assert!(table.is_dirty());

        let err = table.change_phase(TableSyncPhase::InCopy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = table
            .change_phase(TableSyncPhase::WannaSync { sync_tick_id: 4 })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        table
            .change_phase(TableSyncPhase::DoSync { sync_tick_id: 7 })
            .unwrap();
        table.change_phase(TableSyncPhase::Ok).unwrap();
    }

    #[test]
    fn refresh_keeps_in_memory_bookkeeping() {
        let mut table = TableState::new("orders", None);
        table.last_snapshot_tick = Some(9);
        table.mark_dirty();

        let loaded = TableState::new("orders", Some("archive.orders")).with_phase(TableSyncPhase::Ok);
        table.refresh_from(loaded);

        assert_eq!(table.dest_table, "archive.orders");
        assert_eq!(table.phase(), TableSyncPhase::Ok);
        assert_eq!(table.last_snapshot_tick, Some(9));
        assert!(!table.is_dirty());
    }
}
