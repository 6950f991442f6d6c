use crate::conversions::name::fq_name;
use crate::state::counter::PhaseCounter;
use crate::state::table::TableState;

/// Tables of a queue as seen by one worker, in registration order.
///
/// The map is reloaded from the state store on every sync pass. In-memory bookkeeping of
/// tables that survive the reload is kept.
#[derive(Debug, Default, Clone)]
pub struct TableMap {
    tables: Vec<TableState>,
}

impl TableMap {
    pub fn new(tables: Vec<TableState>) -> Self {
        Self { tables }
    }

    /// Replaces the content with freshly loaded states.
    pub fn reload(&mut self, loaded: Vec<TableState>) {
        let mut previous = std::mem::take(&mut self.tables);

        self.tables = loaded
            .into_iter()
            .map(|loaded| {
                match previous.iter().position(|table| table.name == loaded.name) {
                    Some(position) => {
                        let mut table = previous.swap_remove(position);
                        table.refresh_from(loaded);
                        table
                    }
                    None => loaded,
                }
            })
            .collect();
    }

    /// Looks a table up, unqualified names resolve to the default schema.
    pub fn get(&self, name: &str) -> Option<&TableState> {
        let name = fq_name(name);
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TableState> {
        let name = fq_name(name);
        self.tables.iter_mut().find(|table| table.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TableState> {
        let name = fq_name(name);
        let position = self.tables.iter().position(|table| table.name == name)?;

        Some(self.tables.remove(position))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableState> {
        self.tables.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TableState> {
        self.tables.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|table| table.name.clone()).collect()
    }

    pub fn counter(&self) -> PhaseCounter {
        PhaseCounter::from_tables(&self.tables)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::table::TableSyncPhase;

    #[test]
    fn reload_keeps_order_and_bookkeeping() {
        let mut orders = TableState::new("orders", None);
        orders.last_snapshot_tick = Some(3);
        let mut map = TableMap::new(vec![orders, TableState::new("items", None)]);

        map.reload(vec![
            TableState::new("orders", None).with_phase(TableSyncPhase::Ok),
            TableState::new("payments", None),
        ]);

        assert_eq!(map.names(), vec!["public.orders", "public.payments"]);
        let orders = map.get("orders").unwrap();
        assert_eq!(orders.phase(), TableSyncPhase::Ok);
        assert_eq!(orders.last_snapshot_tick, Some(3));
        assert!(map.get("public.items").is_none());
    }
}
