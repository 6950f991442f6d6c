use std::pin::pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use pg_escape::quote_identifier;
use replica::bail;
use replica::conversions::name::quote_fq_ident;
use replica::error::{ErrorKind, ReplicaError, ReplicaResult};
use replica::replication::copy::{CopyDelegate, CopyRequest};
use replica::state::snapshot::CopySnapshot;
use replica_config::shared::PgConnectionConfig;
use tokio_postgres::Client;
use tracing::info;

use crate::connection::connect;

const COLUMNS_QUERY: &str = r#"
    select a.attname
    from pg_catalog.pg_attribute a
    where a.attrelid = $1::text::regclass
      and a.attnum > 0
      and not a.attisdropped
      and a.attgenerated = ''
    order by a.attnum
"#;

async fn table_columns(client: &Client, table: &str) -> ReplicaResult<Vec<String>> {
    let rows = client.query(COLUMNS_QUERY, &[&quote_fq_ident(table)]).await?;

    rows.iter()
        .map(|row| row.try_get::<_, String>("attname").map_err(ReplicaError::from))
        .collect()
}

/// Columns present on both sides, in source order.
fn common_columns(source: &[String], destination: &[String]) -> Vec<String> {
    source
        .iter()
        .filter(|column| destination.contains(column))
        .cloned()
        .collect()
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<_>>()
        .join(", ")
}

fn copy_out_sql(table: &str, columns: &[String], condition: Option<&str>) -> String {
    let table = quote_fq_ident(table);
    let columns = column_list(columns);

    match condition {
        Some(condition) => {
            format!("copy (select {columns} from only {table} where {condition}) to stdout")
        }
        None => format!("copy {table} ({columns}) to stdout"),
    }
}

fn copy_in_sql(table: &str, columns: &[String]) -> String {
    format!(
        "copy {} ({}) from stdin",
        quote_fq_ident(table),
        column_list(columns)
    )
}

/// [`CopyDelegate`] streaming a table from the source database into the destination.
///
/// The copy reads the source in a repeatable read transaction that forces a tick of the
/// queue first, so the tick's snapshot and the copied rows are the same point in time.
#[derive(Debug, Clone)]
pub struct PgCopyDelegate {
    source: Arc<PgConnectionConfig>,
    destination: Arc<PgConnectionConfig>,
}

impl PgCopyDelegate {
    pub fn new(source: PgConnectionConfig, destination: PgConnectionConfig) -> Self {
        Self {
            source: Arc::new(source),
            destination: Arc::new(destination),
        }
    }
}

impl CopyDelegate for PgCopyDelegate {
    async fn copy_table(&self, request: &CopyRequest) -> ReplicaResult<CopySnapshot> {
        let source = connect(&self.source).await?;
        let destination = connect(&self.destination).await?;

        source
            .batch_execute("begin isolation level repeatable read")
            .await?;
        let tick_id: i64 = source
            .query_one("select pgq.ticker($1)", &[&request.queue])
            .await?
            .try_get(0)?;

        let source_columns = table_columns(&source, &request.table).await?;
        let dest_columns = table_columns(&destination, &request.dest_table).await?;
        let columns = common_columns(&source_columns, &dest_columns);
        if columns.is_empty() {
            bail!(
                ErrorKind::CopyFailed,
                "Source and destination tables have no column in common",
                format!("{} -> {}", request.table, request.dest_table)
            );
        }

        destination
            .batch_execute(&format!(
                "begin; set local session_replication_role = replica; truncate only {}",
                quote_fq_ident(&request.dest_table)
            ))
            .await?;

        let copy_out = copy_out_sql(&request.table, &columns, request.condition.as_deref());
        let copy_in = copy_in_sql(&request.dest_table, &columns);

        let mut rows = pin!(source.copy_out(copy_out.as_str()).await?);
        let mut sink = pin!(destination.copy_in::<_, Bytes>(copy_in.as_str()).await?);
        sink.send_all(&mut rows).await?;
        let copied = sink.as_mut().finish().await?;

        destination.batch_execute("commit").await?;
        source.batch_execute("commit").await?;

        destination
            .batch_execute(&format!("analyze {}", quote_fq_ident(&request.dest_table)))
            .await?;

        info!(
            table = %request.table,
            dest_table = %request.dest_table,
            rows = copied,
            tick_id,
            "copied table"
        );

        Ok(CopySnapshot::new(tick_id))
    }
}
