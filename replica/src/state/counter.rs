use std::collections::HashMap;

use metrics::gauge;

use crate::metrics::{PHASE_LABEL, REPLICA_TABLES_TOTAL};
use crate::state::table::{TableState, TableSyncPhaseType};

/// Tally of tables per phase, recomputed on every sync pass.
#[derive(Debug, Default, Clone)]
pub struct PhaseCounter {
    counts: HashMap<TableSyncPhaseType, usize>,
}

impl PhaseCounter {
    pub fn from_tables<'a>(tables: impl IntoIterator<Item = &'a TableState>) -> Self {
        let mut counts = HashMap::new();
        for table in tables {
            *counts.entry(table.phase_type()).or_insert(0) += 1;
        }

        Self { counts }
    }

    pub fn get(&self, phase_type: TableSyncPhaseType) -> usize {
        self.counts.get(&phase_type).copied().unwrap_or(0)
    }

    /// Number of copies that may still be launched given `max_parallel_copies`.
    pub fn copy_capacity(&self, max_parallel_copies: u16) -> usize {
        usize::from(max_parallel_copies).saturating_sub(self.get(TableSyncPhaseType::InCopy))
    }

    /// Publishes the tally as the per phase table gauge.
    pub fn record(&self, queue_name: &str) {
        for phase_type in TableSyncPhaseType::ALL {
            gauge!(
                REPLICA_TABLES_TOTAL,
                "queue" => queue_name.to_owned(),
                PHASE_LABEL => phase_type.to_string()
            )
            .set(self.get(phase_type) as f64);
        }
    }
}
