//! Conversions between queue payloads, names and SQL text.

pub mod name;
pub mod sql;
pub mod statements;
pub mod urlenc;
