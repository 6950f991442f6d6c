use std::fmt;
use std::future::Future;

use crate::error::ReplicaResult;

/// The role a worker plays on its queue.
///
/// A role also carries the properties that uniquely identify the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRole {
    /// Replays events of tables in sync and decides when tables get copied.
    Main,
    /// Copies one table and replays its backlog until the main worker takes over.
    Copy { table: String },
}

impl WorkerRole {
    pub fn is_copy(&self) -> bool {
        matches!(self, WorkerRole::Copy { .. })
    }

    /// Table owned by a copy worker.
    pub fn copy_table(&self) -> Option<&str> {
        match self {
            WorkerRole::Main => None,
            WorkerRole::Copy { table } => Some(table),
        }
    }

    /// Queue consumer used by a worker with this role.
    pub fn consumer_name(&self, main_consumer: &str) -> String {
        match self {
            WorkerRole::Main => main_consumer.to_owned(),
            WorkerRole::Copy { table } => format!("{main_consumer}_copy_{table}"),
        }
    }

    /// Value of the `role` metric label.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerRole::Main => "main",
            WorkerRole::Copy { .. } => "copy",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Main => f.write_str("main"),
            WorkerRole::Copy { table } => write!(f, "copy({table})"),
        }
    }
}

/// A type that can be started as a worker.
///
/// `H` is the handle returned once the worker runs.
pub trait Worker<H>
where
    H: WorkerHandle,
{
    /// Starts the worker and returns a handle to it.
    fn start(self) -> impl Future<Output = ReplicaResult<H>> + Send;
}

/// A handle to a running worker.
pub trait WorkerHandle {
    /// Resolves when the worker completes, with the error it failed with if any.
    fn wait(self) -> impl Future<Output = ReplicaResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_workers_get_their_own_consumer() {
        let role = WorkerRole::Copy {
            table: "public.orders".to_owned(),
        };

        assert_eq!(role.consumer_name("leaf"), "leaf_copy_public.orders");
        assert_eq!(WorkerRole::Main.consumer_name("leaf"), "leaf");
        assert_eq!(role.copy_table(), Some("public.orders"));
    }
}
