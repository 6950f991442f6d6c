use pg_escape::{quote_identifier, quote_literal};

use crate::bail;
use crate::conversions::name::quote_fq_ident;
use crate::error::{ErrorKind, ReplicaResult};
use crate::types::{ChangeOp, RowChange};

fn literal(value: &Option<String>) -> String {
    match value {
        Some(value) => quote_literal(value),
        None => "null".to_owned(),
    }
}

fn pkey_condition(change: &RowChange) -> ReplicaResult<String> {
    if change.pkey_columns.is_empty() {
        bail!(
            ErrorKind::InvalidEvent,
            "Row change without primary key cannot be applied",
            format!("{:?} on {}", change.op, change.table)
        );
    }

    let mut conditions = Vec::with_capacity(change.pkey_columns.len());
    for column in &change.pkey_columns {
        let Some(Some(value)) = change.row.get(column) else {
            bail!(
                ErrorKind::InvalidEvent,
                "Primary key value is missing",
                format!("column {column} of {}", change.table)
            );
        };
        conditions.push(format!(
            "{} = {}",
            quote_identifier(column),
            quote_literal(value)
        ));
    }

    Ok(conditions.join(" and "))
}

/// Renders the statement applying `change` on a Postgres destination.
pub fn render_change_sql(change: &RowChange) -> ReplicaResult<String> {
    let table = quote_fq_ident(&change.table);

    let sql = match change.op {
        ChangeOp::Insert => {
            let columns = change
                .row
                .keys()
                .map(|column| quote_identifier(column).into_owned())
                .collect::<Vec<_>>();
            let values = change.row.values().map(literal).collect::<Vec<_>>();

            format!(
                "insert into {table} ({}) values ({});",
                columns.join(", "),
                values.join(", ")
            )
        }
        ChangeOp::Update => {
            let condition = pkey_condition(change)?;
            let mut assignments = change
                .row
                .iter()
                .filter(|(column, _)| !change.pkey_columns.contains(column))
                .map(|(column, value)| format!("{} = {}", quote_identifier(column), literal(value)))
                .collect::<Vec<_>>();

            // Only key columns changed hands, keep the statement valid.
            if assignments.is_empty() {
                assignments = change
                    .pkey_columns
                    .iter()
                    .map(|column| {
                        let column = quote_identifier(column);
                        format!("{column} = {column}")
                    })
                    .collect();
            }

            format!(
                "update only {table} set {} where {condition};",
                assignments.join(", ")
            )
        }
        ChangeOp::Delete => {
            let condition = pkey_condition(change)?;
            format!("delete from only {table} where {condition};")
        }
        ChangeOp::Replace => format!("truncate only {table};"),
    };

    Ok(sql)
}
