use std::fmt;

/// Sequence number of a tick in the queue.
pub type TickId = i64;

/// Identifier of an event inside the queue.
pub type EventId = i64;

/// Identifier of an open batch on the queue.
pub type BatchId = i64;

/// Control events emitted by the provider when the replication set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    AddTable,
    RemoveTable,
    RemoveSeq,
    UpdateSeq,
}

impl ControlKind {
    fn from_type(ev_type: &str) -> Option<ControlKind> {
        match ev_type {
            "londiste.add-table" => Some(ControlKind::AddTable),
            "londiste.remove-table" => Some(ControlKind::RemoveTable),
            "londiste.remove-seq" => Some(ControlKind::RemoveSeq),
            "londiste.update-seq" => Some(ControlKind::UpdateSeq),
            _ => None,
        }
    }

    pub fn as_type(&self) -> &'static str {
        match self {
            ControlKind::AddTable => "londiste.add-table",
            ControlKind::RemoveTable => "londiste.remove-table",
            ControlKind::RemoveSeq => "londiste.remove-seq",
            ControlKind::UpdateSeq => "londiste.update-seq",
        }
    }
}

/// Kind of an [`Event`], parsed from the queue's event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Truncate,
    Execute,
    Control(ControlKind),
    /// Any type this worker does not know; skipped and counted as ignored.
    Unknown(String),
}

impl EventKind {
    /// Parses a queue event type into a kind and the primary key columns it carries.
    ///
    /// Row events are either a bare operation letter (`I`, `U`, `D`) or the letter
    /// followed by the primary key list (`I:id,code`).
    pub fn parse(ev_type: &str) -> (EventKind, Vec<String>) {
        let (op, pkeys) = match ev_type.split_once(':') {
            Some((op, pkeys)) if op.len() == 1 => (
                op,
                pkeys
                    .split(',')
                    .filter(|column| !column.is_empty())
                    .map(str::to_owned)
                    .collect(),
            ),
            _ => (ev_type, Vec::new()),
        };

        let kind = match op {
            "I" => EventKind::Insert,
            "U" => EventKind::Update,
            "D" => EventKind::Delete,
            "R" => EventKind::Truncate,
            "EXECUTE" => EventKind::Execute,
            other => match ControlKind::from_type(other) {
                Some(control) => EventKind::Control(control),
                None => return (EventKind::Unknown(ev_type.to_owned()), Vec::new()),
            },
        };

        (kind, pkeys)
    }

    /// Returns `true` for events that carry table rows.
    pub fn is_row(&self) -> bool {
        matches!(
            self,
            EventKind::Insert | EventKind::Update | EventKind::Delete
        )
    }
}

/// One immutable event delivered by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    /// Tick that closed the transaction producing this event.
    pub tick_id: TickId,
    pub kind: EventKind,
    /// Primary key columns for row events.
    pub pkey_columns: Vec<String>,
    /// Url-encoded row for row events, SQL for execute events.
    pub payload: String,
    /// Source table for row events. For execute events this slot holds the execute name
    /// and for control events the affected table or sequence.
    pub table_name: Option<String>,
    /// Additional attributes, the `ExecAttrs` of an execute event.
    pub attrs: Option<String>,
}

impl Event {
    /// Builds an event from the raw queue columns.
    pub fn from_queue(
        id: EventId,
        tick_id: TickId,
        ev_type: &str,
        payload: impl Into<String>,
        table_name: Option<String>,
        attrs: Option<String>,
    ) -> Event {
        let (kind, pkey_columns) = EventKind::parse(ev_type);

        Event {
            id,
            tick_id,
            kind,
            pkey_columns,
            payload: payload.into(),
            table_name,
            attrs,
        }
    }

    /// Context used to annotate errors raised while processing this event.
    pub fn context(&self) -> EventContext {
        EventContext {
            event_id: self.id,
            tick_id: self.tick_id,
        }
    }
}

/// Identity of the event being processed, attached to errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub event_id: EventId,
    pub tick_id: TickId,
}

impl fmt::Display for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ev_id={},tick={}]", self.event_id, self.tick_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_row_types_with_pkeys() {
        let (kind, pkeys) = EventKind::parse("U:id,code");
        assert_eq!(kind, EventKind::Update);
        assert_eq!(pkeys, vec!["id".to_owned(), "code".to_owned()]);

        let (kind, pkeys) = EventKind::parse("I");
        assert_eq!(kind, EventKind::Insert);
        assert!(pkeys.is_empty());
    }

    #[test]
    fn parses_special_types() {
        assert_eq!(EventKind::parse("R").0, EventKind::Truncate);
        assert_eq!(EventKind::parse("EXECUTE").0, EventKind::Execute);
        assert_eq!(
            EventKind::parse("londiste.update-seq").0,
            EventKind::Control(ControlKind::UpdateSeq)
        );
        assert_eq!(
            EventKind::parse("pgq.location-info").0,
            EventKind::Unknown("pgq.location-info".to_owned())
        );
    }

    #[test]
    fn context_renders_event_identity() {
        let event = Event::from_queue(11, 4, "D:id", "id=1", Some("public.t".into()), None);
        assert_eq!(event.context().to_string(), "[ev_id=11,tick=4]");
    }
}
