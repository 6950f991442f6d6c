use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::bail;
use crate::conversions::sql::render_change_sql;
use crate::conversions::urlenc::decode_row;
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::default::change_op;
use crate::handlers::{HandlerConfig, TableHandler};
use crate::types::{BatchInfo, Event, RowChange, RowData};

/// Renames and filters columns before applying rows.
///
/// Arguments:
/// - `map=src:dst,...` columns to keep and their destination names; primary key columns
///   are always kept. Without a map every column is kept as is.
/// - `ignore_truncate` skips truncate events.
/// - `copy_condition` filters the bulk copy.
/// - `batch_save_dir` writes the SQL of every batch to `{dir}/batch_{tick}/{table}.sql`.
#[derive(Debug)]
pub struct ColumnMapperHandler {
    config: HandlerConfig,
    column_map: Option<Vec<(String, String)>>,
    batch_save_dir: Option<PathBuf>,
    batch_file: Option<BufWriter<File>>,
}

impl ColumnMapperHandler {
    pub const NAME: &'static str = "column_mapper";

    pub fn new(config: HandlerConfig) -> ReplicaResult<Self> {
        let column_map = config
            .args
            .get("map")
            .map(|map| parse_map(map))
            .transpose()?;
        let batch_save_dir = config
            .args
            .get("batch_save_dir")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            config,
            column_map,
            batch_save_dir,
            batch_file: None,
        })
    }

    fn map_row(&self, row: RowData, pkey_columns: &[String]) -> (RowData, Vec<String>) {
        let Some(column_map) = &self.column_map else {
            return (row, pkey_columns.to_vec());
        };

        let rename = |column: &str| -> String {
            column_map
                .iter()
                .find(|(src, _)| src == column)
                .map(|(_, dst)| dst.clone())
                .unwrap_or_else(|| column.to_owned())
        };

        let mapped = row
            .into_iter()
            .filter(|(column, _)| {
                pkey_columns.contains(column) || column_map.iter().any(|(src, _)| src == column)
            })
            .map(|(column, value)| (rename(&column), value))
            .collect();
        let pkey_columns = pkey_columns.iter().map(|column| rename(column)).collect();

        (mapped, pkey_columns)
    }
}

fn parse_map(map: &str) -> ReplicaResult<Vec<(String, String)>> {
    map.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((src, dst)) if !src.trim().is_empty() && !dst.trim().is_empty() => {
                Ok((src.trim().to_owned(), dst.trim().to_owned()))
            }
            _ => bail!(ErrorKind::ConfigError, "Invalid column mapping", pair),
        })
        .collect()
}

impl TableHandler for ColumnMapperHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare_batch(&mut self, batch: &BatchInfo) -> ReplicaResult<()> {
        let Some(dir) = &self.batch_save_dir else {
            return Ok(());
        };

        let path = dir.join(format!("batch_{}", batch.tick_id));
        fs::create_dir_all(&path)?;

        let table_name = self
            .config
            .dest_table
            .split_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.config.dest_table);
        let file = File::create(path.join(format!("{table_name}.sql")))?;

        info!(path = %path.display(), table = %self.config.dest_table, "saving batch sql");
        self.batch_file = Some(BufWriter::new(file));

        Ok(())
    }

    fn process_event(&mut self, event: &Event, emit: &mut dyn FnMut(RowChange)) -> ReplicaResult<()> {
        let (row, pkey_columns) = self.map_row(decode_row(&event.payload)?, &event.pkey_columns);
        if row.is_empty() {
            info!(
                event_id = event.id,
                table = %self.config.table,
                "empty column set, event ignored"
            );
            return Ok(());
        }

        let change = RowChange {
            event_id: event.id,
            table: self.config.dest_table.clone(),
            op: change_op(event)?,
            pkey_columns,
            row,
        };

        if let Some(file) = self.batch_file.as_mut() {
            writeln!(file, "{}", render_change_sql(&change)?)?;
        }

        emit(change);

        Ok(())
    }

    fn finish_batch(&mut self, _batch: &BatchInfo) -> ReplicaResult<()> {
        if let Some(mut file) = self.batch_file.take() {
            file.flush()?;
            debug!(table = %self.config.dest_table, "batch sql saved");
        }

        Ok(())
    }

    fn reset(&mut self) {
        self.batch_file = None;
    }

    fn ignore_truncate(&self) -> bool {
        self.config.flag("ignore_truncate")
    }

    fn copy_condition(&self) -> Option<&str> {
        self.config
            .args
            .get("copy_condition")
            .map(String::as_str)
            .filter(|condition| !condition.is_empty())
    }
}
