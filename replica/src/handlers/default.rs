use crate::bail;
use crate::conversions::urlenc::decode_row;
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::{HandlerConfig, TableHandler};
use crate::types::{BatchInfo, ChangeOp, Event, EventKind, RowChange};

/// Maps an event kind to the change operation applied to the destination.
pub(crate) fn change_op(event: &Event) -> ReplicaResult<ChangeOp> {
    let op = match event.kind {
        EventKind::Insert => ChangeOp::Insert,
        EventKind::Update => ChangeOp::Update,
        EventKind::Delete => ChangeOp::Delete,
        EventKind::Truncate => ChangeOp::Replace,
        _ => bail!(
            ErrorKind::InvalidEvent,
            "Event does not carry a row",
            format!("{:?}", event.kind)
        ),
    };

    Ok(op)
}

/// Applies rows to the destination table as they are.
#[derive(Debug)]
pub struct DefaultHandler {
    config: HandlerConfig,
}

impl DefaultHandler {
    pub const NAME: &'static str = "default";

    pub fn new(config: HandlerConfig) -> Self {
        Self { config }
    }
}

impl TableHandler for DefaultHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare_batch(&mut self, _batch: &BatchInfo) -> ReplicaResult<()> {
        Ok(())
    }

    fn process_event(&mut self, event: &Event, emit: &mut dyn FnMut(RowChange)) -> ReplicaResult<()> {
        emit(RowChange {
            event_id: event.id,
            table: self.config.dest_table.clone(),
            op: change_op(event)?,
            pkey_columns: event.pkey_columns.clone(),
            row: decode_row(&event.payload)?,
        });

        Ok(())
    }

    fn finish_batch(&mut self, _batch: &BatchInfo) -> ReplicaResult<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn ignore_truncate(&self) -> bool {
        self.config.flag("ignore_truncate")
    }
}
