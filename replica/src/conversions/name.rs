use pg_escape::quote_identifier;

/// Schema assumed for unqualified table and sequence names.
const DEFAULT_SCHEMA: &str = "public";

/// Qualifies `name` with the default schema when it has none.
pub fn fq_name(name: &str) -> String {
    if name.contains('.') {
        name.to_owned()
    } else {
        format!("{DEFAULT_SCHEMA}.{name}")
    }
}

/// Quotes a possibly schema qualified name, e.g. `public."Order"`.
pub fn quote_fq_ident(name: &str) -> String {
    let fq = fq_name(name);
    let (schema, table) = fq.split_once('.').unwrap_or((DEFAULT_SCHEMA, fq.as_str()));

    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}
