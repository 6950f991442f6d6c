use replica::error::{ErrorKind, ReplicaError, classify_sqlstate};
use replica::replica_error;

/// Converts a [`sqlx::Error`] into a [`ReplicaError`].
///
/// Database errors are classified by SQLSTATE like the errors of the other Postgres
/// connections, so a lock timeout in the state store retries the batch as well.
pub fn sqlx_error(err: sqlx::Error) -> ReplicaError {
    let (kind, description) = match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => classify_sqlstate(&code),
            None => (ErrorKind::StateStoreError, "State store query failed"),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => (
            ErrorKind::ConnectionFailed,
            "State store connection failed",
        ),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            (ErrorKind::InvalidData, "State store row could not be decoded")
        }
        sqlx::Error::Configuration(_) => (ErrorKind::ConfigError, "Invalid state store configuration"),
        _ => (ErrorKind::StateStoreError, "State store query failed"),
    };

    replica_error!(kind, description, err)
}
