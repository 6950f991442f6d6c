use std::error;
use std::fmt;

/// Result type used across the replication worker.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Error type of the replication worker.
///
/// A [`ReplicaError`] is either a single error with a static description and an optional
/// dynamic detail, or an aggregation of several errors. The [`ErrorKind`] drives how the
/// worker reacts: transient kinds retry the batch, invariant violations abort.
#[derive(Debug, Clone)]
pub struct ReplicaError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<ReplicaError>),
}

/// Categories of errors raised while replicating.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    ConnectionFailed,
    AuthenticationError,

    // Query & Execution Errors
    QueryFailed,
    LockTimeout,
    OperationCanceled,
    DatabaseShutdown,

    // Schema & Data Errors
    SchemaError,
    ConstraintViolation,
    ConversionError,
    InvalidData,
    InvalidEvent,

    // Configuration Errors
    ConfigError,
    UnknownHandler,

    // IO & Serialization Errors
    IoError,
    SerializationError,
    DeserializationError,

    // State & Workflow Errors
    InvalidState,
    StateStoreError,
    TableNotFound,
    CopyFailed,
    CopyWorkerPanic,

    // Apply Errors
    SinkFlushFailed,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` when retrying the same batch after a sleep can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed
                | ErrorKind::QueryFailed
                | ErrorKind::LockTimeout
                | ErrorKind::OperationCanceled
                | ErrorKind::DatabaseShutdown
                | ErrorKind::ConstraintViolation
                | ErrorKind::IoError
                | ErrorKind::StateStoreError
                | ErrorKind::SinkFlushFailed
        )
    }

    /// Returns `true` when a failure may have left external state that needs an operator.
    ///
    /// A buffered flush can be partially ingested by the sink before failing.
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, ErrorKind::SinkFlushFailed)
    }
}

impl ReplicaError {
    /// Creates a [`ReplicaError`] aggregating multiple errors.
    pub fn many(errors: Vec<ReplicaError>) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the detail of the error, or of the first aggregated error having one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }

    /// Returns `true` if every contained kind is retryable.
    pub fn is_retryable(&self) -> bool {
        let kinds = self.kinds();
        !kinds.is_empty() && kinds.iter().all(ErrorKind::is_retryable)
    }

    /// Returns `true` if any contained kind needs an operator to look at external state.
    pub fn requires_manual_intervention(&self) -> bool {
        self.kinds()
            .iter()
            .any(ErrorKind::requires_manual_intervention)
    }

    /// Prefixes the detail of this error with `context`.
    ///
    /// Used to annotate failures with the event that was being processed.
    pub fn with_context(self, context: impl fmt::Display) -> ReplicaError {
        let repr = match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                ErrorRepr::WithDescriptionAndDetail(kind, desc, context.to_string())
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                ErrorRepr::WithDescriptionAndDetail(kind, desc, format!("{context} {detail}"))
            }
            ErrorRepr::Many(errors) => {
                let context = context.to_string();
                ErrorRepr::Many(
                    errors
                        .into_iter()
                        .map(|err| err.with_context(&context))
                        .collect(),
                )
            }
        };

        ReplicaError { repr }
    }
}

impl PartialEq for ReplicaError {
    fn eq(&self, other: &ReplicaError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)
            }
            ErrorRepr::Many(ref errors) => match errors.as_slice() {
                [] => write!(f, "Multiple errors occurred (empty)"),
                [error] => error.fmt(f),
                errors => {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }

                    Ok(())
                }
            },
        }
    }
}

impl error::Error for ReplicaError {}

impl From<(ErrorKind, &'static str)> for ReplicaError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for ReplicaError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl<E> From<Vec<E>> for ReplicaError
where
    E: Into<ReplicaError>,
{
    fn from(errors: Vec<E>) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<std::io::Error> for ReplicaError {
    fn from(err: std::io::Error) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::IoError,
                "I/O error occurred",
                err.to_string(),
            ),
        }
    }
}

/// Maps [`serde_json::Error`] by its category.
impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> ReplicaError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

impl From<std::num::ParseIntError> for ReplicaError {
    fn from(err: std::num::ParseIntError) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConversionError,
                "Integer parsing failed",
                err.to_string(),
            ),
        }
    }
}

impl From<std::string::FromUtf8Error> for ReplicaError {
    fn from(err: std::string::FromUtf8Error) -> ReplicaError {
        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConversionError,
                "UTF-8 string conversion failed",
                err.to_string(),
            ),
        }
    }
}

/// Maps [`reqwest::Error`] from the buffered sink to [`ErrorKind::SinkFlushFailed`].
impl From<reqwest::Error> for ReplicaError {
    fn from(err: reqwest::Error) -> ReplicaError {
        let description = if err.is_status() {
            "Sink rejected the batch"
        } else if err.is_timeout() {
            "Sink request timed out"
        } else {
            "Sink request failed"
        };

        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::SinkFlushFailed,
                description,
                err.to_string(),
            ),
        }
    }
}

/// Maps [`tokio_postgres::Error`] by SQLSTATE class.
impl From<tokio_postgres::Error> for ReplicaError {
    fn from(err: tokio_postgres::Error) -> ReplicaError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => classify_sqlstate(sqlstate.code()),
            None if err.is_closed() => (ErrorKind::ConnectionFailed, "PostgreSQL connection closed"),
            None => (ErrorKind::QueryFailed, "PostgreSQL client error"),
        };

        ReplicaError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

/// Classifies a five character SQLSTATE code.
///
/// Exposed so that other Postgres drivers map codes the same way.
pub fn classify_sqlstate(code: &str) -> (ErrorKind, &'static str) {
    match code {
        "55P03" => (ErrorKind::LockTimeout, "PostgreSQL lock not available"),
        "57014" => (ErrorKind::OperationCanceled, "PostgreSQL query canceled"),
        "57P01" | "57P02" | "57P03" => {
            (ErrorKind::DatabaseShutdown, "PostgreSQL database shutting down")
        }
        "40001" | "40P01" => (
            ErrorKind::QueryFailed,
            "PostgreSQL serialization failure or deadlock",
        ),
        "23503" => (ErrorKind::ConstraintViolation, "PostgreSQL foreign key violation"),
        _ => match code.get(..2) {
            Some("08") => (ErrorKind::ConnectionFailed, "PostgreSQL connection error"),
            Some("28") => (
                ErrorKind::AuthenticationError,
                "PostgreSQL authentication failed",
            ),
            Some("23") => (
                ErrorKind::ConstraintViolation,
                "PostgreSQL constraint violation",
            ),
            Some("22") => (
                ErrorKind::ConversionError,
                "PostgreSQL data conversion error",
            ),
            Some("42") => (ErrorKind::SchemaError, "PostgreSQL syntax or schema error"),
            Some("53") | Some("58") => (ErrorKind::IoError, "PostgreSQL resource error"),
            Some("25") | Some("55") => (
                ErrorKind::InvalidState,
                "PostgreSQL object or transaction state error",
            ),
            _ => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, replica_error};

    #[test]
    fn test_simple_error_creation() {
        let err = ReplicaError::from((ErrorKind::ConnectionFailed, "Database connection failed"));
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(err.detail(), None);
        assert_eq!(err.kinds(), vec![ErrorKind::ConnectionFailed]);
    }

    #[test]
    fn test_multiple_errors() {
        let multi_err = ReplicaError::many(vec![
            ReplicaError::from((ErrorKind::InvalidData, "Invalid payload")),
            ReplicaError::from((
                ErrorKind::ConversionError,
                "Type mismatch",
                "expected integer".to_string(),
            )),
        ]);

        assert_eq!(multi_err.kind(), ErrorKind::InvalidData);
        assert_eq!(
            multi_err.kinds(),
            vec![ErrorKind::InvalidData, ErrorKind::ConversionError]
        );
        assert_eq!(multi_err.detail(), Some("expected integer"));
    }

    #[test]
    fn test_empty_multiple_errors() {
        let multi_err = ReplicaError::many(vec![]);
        assert_eq!(multi_err.kind(), ErrorKind::Unknown);
        assert!(!multi_err.is_retryable());
        assert_eq!(format!("{multi_err}"), "Multiple errors occurred (empty)");
    }

    #[test]
    fn test_retry_classification() {
        let transient = ReplicaError::from((ErrorKind::ConnectionFailed, "lost connection"));
        let fatal = ReplicaError::from((ErrorKind::InvalidState, "impossible state"));
        let flush = ReplicaError::from((ErrorKind::SinkFlushFailed, "sink returned 500"));

        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(flush.is_retryable());
        assert!(flush.requires_manual_intervention());
        assert!(!ReplicaError::many(vec![transient, fatal]).is_retryable());
    }

    #[test]
    fn test_context_is_prefixed_to_detail() {
        let err = ReplicaError::from((
            ErrorKind::QueryFailed,
            "Statement failed",
            "relation does not exist".to_string(),
        ))
        .with_context("[ev_id=42,tick=7]");

        assert_eq!(
            err.detail(),
            Some("[ev_id=42,tick=7] relation does not exist")
        );

        let err = ReplicaError::from((ErrorKind::InvalidEvent, "Bad event"))
            .with_context("[ev_id=1,tick=2]");
        assert_eq!(err.detail(), Some("[ev_id=1,tick=2]"));
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);
    }

    #[test]
    fn test_error_display_with_detail() {
        let err = ReplicaError::from((
            ErrorKind::QueryFailed,
            "SQL query failed",
            "Invalid table name".to_string(),
        ));
        let display_str = format!("{err}");
        assert!(display_str.contains("QueryFailed"));
        assert!(display_str.contains("SQL query failed"));
        assert!(display_str.contains("Invalid table name"));
    }

    #[test]
    fn test_macros() {
        fn failing(with_detail: bool) -> ReplicaResult<i32> {
            if with_detail {
                bail!(ErrorKind::TableNotFound, "Table missing", "public.orders");
            }
            bail!(ErrorKind::InvalidState, "Invalid state");
        }

        let err = replica_error!(ErrorKind::ConfigError, "Bad config");
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        let err = failing(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
        assert_eq!(err.detail(), Some("public.orders"));
        assert_eq!(failing(false).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate("08006").0, ErrorKind::ConnectionFailed);
        assert_eq!(classify_sqlstate("23505").0, ErrorKind::ConstraintViolation);
        assert_eq!(classify_sqlstate("42P01").0, ErrorKind::SchemaError);
        assert_eq!(classify_sqlstate("55P03").0, ErrorKind::LockTimeout);
        assert_eq!(classify_sqlstate("XX000").0, ErrorKind::QueryFailed);
    }

    #[test]
    fn test_json_error_classification() {
        let err: ReplicaError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}
