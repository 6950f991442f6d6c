//! Macros for building and returning [`crate::error::ReplicaError`] values.

/// Creates a [`crate::error::ReplicaError`] from a kind, a static description and an
/// optional detail.
#[macro_export]
macro_rules! replica_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::ReplicaError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::ReplicaError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with a [`crate::error::ReplicaError`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::replica_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::replica_error!($kind, $desc, $detail))
    };
}
