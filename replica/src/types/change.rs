use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::EventId;

/// Column values of one row, `None` is SQL NULL.
pub type RowData = BTreeMap<String, Option<String>>;

/// Operation of a [`RowChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeOp {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    /// Replace the whole content of the table, produced by truncate events.
    #[serde(rename = "R")]
    Replace,
}

/// One shaped change for a destination table, produced by a table handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub event_id: EventId,
    /// Fully qualified destination table.
    pub table: String,
    pub op: ChangeOp,
    pub pkey_columns: Vec<String>,
    pub row: RowData,
}

impl RowChange {
    /// Values of the primary key columns, in key order.
    pub fn pkey_values(&self) -> Vec<Option<String>> {
        self.pkey_columns
            .iter()
            .map(|column| self.row.get(column).cloned().flatten())
            .collect()
    }
}
