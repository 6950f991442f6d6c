use crate::types::{ControlKind, Event};

/// Builds a row insert for `table`. `row` is the url-encoded payload, e.g. `id=1&name=a`.
pub fn insert(table: &str, row: &str) -> Event {
    row_event("I:id", table, row)
}

pub fn update(table: &str, row: &str) -> Event {
    row_event("U:id", table, row)
}

pub fn delete(table: &str, row: &str) -> Event {
    row_event("D:id", table, row)
}

pub fn truncate(table: &str) -> Event {
    Event::from_queue(0, 0, "R", "", Some(table.to_owned()), None)
}

/// Builds a row event with an explicit type, e.g. `I:region,id`.
pub fn row_event(ev_type: &str, table: &str, row: &str) -> Event {
    Event::from_queue(0, 0, ev_type, row, Some(table.to_owned()), None)
}

/// Builds an execute event named `name` running `sql`, restricted by `attrs`.
pub fn execute(name: &str, sql: &str, attrs: Option<&str>) -> Event {
    Event::from_queue(
        0,
        0,
        "EXECUTE",
        sql,
        Some(name.to_owned()),
        attrs.map(str::to_owned),
    )
}

/// Builds a control event about `target`, with `payload` as event data.
pub fn control(kind: ControlKind, target: &str, payload: &str) -> Event {
    Event::from_queue(0, 0, kind.as_type(), payload, Some(target.to_owned()), None)
}
