use std::future::Future;

use crate::error::ReplicaResult;
use crate::state::table::TableState;

/// Outcome of registering an execute event with the state store.
///
/// Codes follow the HTTP convention: `200` means the statement has to be executed, any
/// code above `200` means it was already handled on this node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExecuteStatus(u16);

impl ExecuteStatus {
    pub const EXECUTE: ExecuteStatus = ExecuteStatus(200);
    pub const ALREADY_APPLIED: ExecuteStatus = ExecuteStatus(301);

    pub fn new(code: u16) -> Self {
        Self(code)
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn already_handled(&self) -> bool {
        self.0 > 200
    }
}

/// Trait for storing and retrieving the synchronization state of the tables of a queue.
///
/// Both the main worker and the copy workers read the states at every pass and write only
/// the records they own, so implementations must handle concurrent access.
pub trait StateStore {
    /// Loads all table states of `queue` in registration order.
    fn load_states(&self, queue: &str) -> impl Future<Output = ReplicaResult<Vec<TableState>>> + Send;

    /// Persists `state` for its table.
    fn save_state(
        &self,
        queue: &str,
        state: &TableState,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Attaches a table to this node. The record is stored as given, normally `Missing`.
    fn register_table(
        &self,
        queue: &str,
        state: TableState,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Detaches a table from this node by deleting its record.
    fn delete_state(&self, queue: &str, table: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Registers an attempt to run the execute event `name`.
    fn register_execute(
        &self,
        queue: &str,
        name: &str,
        sql: &str,
        attrs: Option<&str>,
    ) -> impl Future<Output = ReplicaResult<ExecuteStatus>> + Send;

    /// Marks the execute event `name` as finished.
    fn finish_execute(&self, queue: &str, name: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Adds `table` to the set of tables replicated somewhere in the queue.
    fn add_global_table(&self, queue: &str, table: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Removes `table` from the global set.
    fn remove_global_table(
        &self,
        queue: &str,
        table: &str,
    ) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Removes `seq` from the global sequence set.
    fn remove_global_seq(&self, queue: &str, seq: &str) -> impl Future<Output = ReplicaResult<()>> + Send;

    /// Returns the sequences replicated to this node.
    fn local_sequences(&self, queue: &str) -> impl Future<Output = ReplicaResult<Vec<String>>> + Send;
}
