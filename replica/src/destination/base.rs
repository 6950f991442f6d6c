use std::fmt;
use std::future::Future;

use crate::conversions::name::fq_name;
use crate::error::ReplicaResult;
use crate::types::{RowChange, TickId};

/// Value of the destination session's replication role.
///
/// Sessions replay changes as `Replica` so that destination triggers do not capture them
/// again. Execute events switch to `Local` for their duration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReplicationRole {
    Replica,
    Local,
    Origin,
}

impl ReplicationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replica => "replica",
            Self::Local => "local",
            Self::Origin => "origin",
        }
    }
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a destination object an execute may require.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Table,
    Sequence,
    Function,
    View,
    Schema,
}

impl ObjectKind {
    /// Qualifies `name` with the default schema, except for schemas themselves.
    pub fn normalize(&self, name: &str) -> String {
        match self {
            Self::Schema => name.to_owned(),
            _ => fq_name(name),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Sequence => "sequence",
            Self::Function => "function",
            Self::View => "view",
            Self::Schema => "schema",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A foreign key constraint involving a replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    /// Table owning the constraint.
    pub table: String,
    pub referenced_table: String,
    /// Statement re-creating the constraint.
    pub restore_sql: String,
}

/// A destination that changes are replicated to.
pub trait Destination: Clone + Send + Sync + 'static {
    type Session: DestinationSession + Send;

    /// Opens a session with its own transaction scope, in the `Replica` role.
    fn open_session(&self) -> impl Future<Output = ReplicaResult<Self::Session>> + Send;
}

/// A connection to the destination.
///
/// Outside of [`DestinationSession::begin`]/[`DestinationSession::commit`] every call
/// takes effect immediately.
pub trait DestinationSession {
    fn begin(&mut self) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Runs one SQL statement.
    fn execute(&mut self, sql: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn apply_change(&mut self, change: &RowChange) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn set_replication_role(
        &mut self,
        role: ReplicationRole,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Returns the foreign keys owned by or referencing `table`.
    fn table_foreign_keys(
        &mut self,
        table: &str,
    ) -> impl Future<Output = ReplicaResult<Vec<ForeignKey>>> + Send;

    fn drop_foreign_key(
        &mut self,
        foreign_key: &ForeignKey,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Returns `true` if an object of `kind` named `name` exists in the destination.
    fn object_exists(
        &mut self,
        kind: ObjectKind,
        name: &str,
    ) -> impl Future<Output = ReplicaResult<bool>> + Send;

    /// Refreshes planner statistics of `table`.
    fn analyze(&mut self, table: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    fn set_sequence(&mut self, seq: &str, value: i64) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Last tick committed on this destination by `consumer`.
    fn completed_tick(
        &mut self,
        consumer: &str,
    ) -> impl Future<Output = ReplicaResult<Option<TickId>>> + Send;

    /// Records `tick_id` as committed by `consumer`, inside the batch transaction.
    fn set_completed_tick(
        &mut self,
        consumer: &str,
        tick_id: TickId,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;
}
