//! Error type shared by every pg_stream operation.
//!
//! A [`CdcError`] is either a single classified failure, carrying an [`ErrorKind`], a static
//! description, optional dynamic detail and source, the callsite and a backtrace, or an aggregate of
//! several errors, which is how [`crate::input::PgStreamInput::close`] reports failures of both the
//! replication session and the checkpoint store.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use pg_stream_postgres::replication::slots::ReplicationSlotError;

pub type CdcResult<T> = Result<T, CdcError>;

/// Classification of a [`CdcError`].
///
/// Callers branch on the kind, for example to decide whether establishing the session is worth
/// retrying.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Source database
    SourceConnectionFailed,
    AuthenticationError,
    SourceQueryFailed,
    SourceSchemaError,
    SourceIoError,
    SourceDatabaseShutdown,
    SourceError,

    // Replication slot
    ReplicationSlotNotFound,
    ReplicationSlotAlreadyExists,
    ReplicationSlotNotCreated,

    // Checkpoint store
    CheckpointStoreConnectionFailed,
    CheckpointReadFailed,
    CheckpointWriteFailed,
    CheckpointStoreCloseFailed,

    // Data
    SerializationError,
    DeserializationError,
    ConversionError,
    InvalidData,

    // Configuration
    ConfigError,
    ValidationError,
    EncryptionError,

    // Lifecycle
    InvalidState,
    ConnectorClosed,
    ConnectorAlreadyStreaming,
    SessionStopFailed,
    SessionPanic,

    IoError,
    Unknown,
}

impl ErrorKind {
    /// Returns `true` for failures that may go away when establishing the session is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::SourceIoError
                | ErrorKind::SourceDatabaseShutdown
                | ErrorKind::CheckpointStoreConnectionFailed
                | ErrorKind::IoError
        )
    }
}

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<CdcError>,
        location: &'static Location<'static>,
    },
}

#[derive(Debug, Clone)]
pub struct CdcError {
    repr: ErrorRepr,
}

impl CdcError {
    /// Kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.kind,
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(CdcError::kind)
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Every kind contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match &self.repr {
            ErrorRepr::Single(payload) => vec![payload.kind],
            ErrorRepr::Many { errors, .. } => errors.iter().flat_map(CdcError::kinds).collect(),
        }
    }

    pub fn description(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Single(payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Dynamic detail, or the first detail found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.detail.as_deref(),
            ErrorRepr::Many { errors, .. } => errors.iter().find_map(CdcError::detail),
        }
    }

    /// Aggregated errors, if this error is an aggregate.
    pub fn errors(&self) -> Option<&[CdcError]> {
        match &self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match &self.repr {
            ErrorRepr::Single(payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. No effect on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(payload) = &mut self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        CdcError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        CdcError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for CdcError {
    fn eq(&self, other: &CdcError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail:", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace:", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    errors.len(),
                    if errors.len() == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, header: &str, body: &str) -> fmt::Result {
    write!(f, "\n  {header}")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for CdcError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CdcError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> CdcError {
        CdcError::from_components(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for CdcError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> CdcError {
        CdcError::from_components(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned unwrapped.
impl<E> From<Vec<E>> for CdcError
where
    E: Into<CdcError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> CdcError {
        let location = Location::caller();
        let mut errors: Vec<CdcError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        CdcError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for CdcError {
    #[track_caller]
    fn from(err: std::io::Error) -> CdcError {
        CdcError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for CdcError {
    #[track_caller]
    fn from(err: serde_json::Error) -> CdcError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        CdcError::from_source(kind, description, err)
    }
}

impl From<std::str::Utf8Error> for CdcError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> CdcError {
        CdcError::from_source(ErrorKind::ConversionError, "UTF-8 conversion failed", err)
    }
}

/// Maps Postgres errors by SQLSTATE class. Errors without a SQLSTATE are transport failures.
impl From<tokio_postgres::Error> for CdcError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> CdcError {
        use tokio_postgres::error::SqlState;

        let (kind, description) = match err.code() {
            None if err.is_closed() => (
                ErrorKind::SourceConnectionFailed,
                "PostgreSQL connection closed",
            ),
            None => (
                ErrorKind::SourceConnectionFailed,
                "PostgreSQL connection failed",
            ),
            Some(code) => match *code {
                SqlState::CONNECTION_EXCEPTION
                | SqlState::CONNECTION_DOES_NOT_EXIST
                | SqlState::CONNECTION_FAILURE
                | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
                | SqlState::TOO_MANY_CONNECTIONS
                | SqlState::CANNOT_CONNECT_NOW => (
                    ErrorKind::SourceConnectionFailed,
                    "PostgreSQL connection failed",
                ),
                SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                    ErrorKind::AuthenticationError,
                    "PostgreSQL authentication failed",
                ),
                SqlState::UNDEFINED_TABLE
                | SqlState::UNDEFINED_COLUMN
                | SqlState::UNDEFINED_SCHEMA
                | SqlState::INVALID_SCHEMA_NAME
                | SqlState::UNDEFINED_FILE => (
                    ErrorKind::SourceSchemaError,
                    "PostgreSQL object not found",
                ),
                SqlState::SYNTAX_ERROR
                | SqlState::INSUFFICIENT_PRIVILEGE
                | SqlState::FEATURE_NOT_SUPPORTED => (
                    ErrorKind::SourceQueryFailed,
                    "PostgreSQL rejected the query",
                ),
                SqlState::OBJECT_IN_USE | SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE => (
                    ErrorKind::InvalidState,
                    "PostgreSQL object is not usable",
                ),
                SqlState::ADMIN_SHUTDOWN | SqlState::CRASH_SHUTDOWN => (
                    ErrorKind::SourceDatabaseShutdown,
                    "PostgreSQL is shutting down",
                ),
                SqlState::IO_ERROR | SqlState::DISK_FULL => {
                    (ErrorKind::SourceIoError, "PostgreSQL I/O error")
                }
                SqlState::DATA_EXCEPTION
                | SqlState::INVALID_TEXT_REPRESENTATION
                | SqlState::CHARACTER_NOT_IN_REPERTOIRE
                | SqlState::UNTRANSLATABLE_CHARACTER => (
                    ErrorKind::ConversionError,
                    "PostgreSQL data conversion failed",
                ),
                _ => (ErrorKind::SourceError, "PostgreSQL error"),
            },
        };

        CdcError::from_source(kind, description, err)
    }
}

impl From<rustls::Error> for CdcError {
    #[track_caller]
    fn from(err: rustls::Error) -> CdcError {
        CdcError::from_source(ErrorKind::EncryptionError, "TLS configuration failed", err)
    }
}

impl From<ReplicationSlotError> for CdcError {
    #[track_caller]
    fn from(err: ReplicationSlotError) -> CdcError {
        CdcError::from_source(
            ErrorKind::ValidationError,
            "Replication slot name is invalid",
            err,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, cdc_error};

    #[test]
    fn single_error_exposes_its_parts() {
        let err = cdc_error!(
            ErrorKind::CheckpointWriteFailed,
            "Checkpoint write failed",
            "key rs_checkpoint_orders"
        );

        assert_eq!(err.kind(), ErrorKind::CheckpointWriteFailed);
        assert_eq!(err.description(), Some("Checkpoint write failed"));
        assert_eq!(err.detail(), Some("key rs_checkpoint_orders"));
        assert!(err.errors().is_none());
        assert!(err.to_string().starts_with("[CheckpointWriteFailed]"));
    }

    #[test]
    fn aggregate_collects_kinds_in_order() {
        let err = CdcError::from(vec![
            cdc_error!(ErrorKind::SessionStopFailed, "Stop failed"),
            cdc_error!(ErrorKind::CheckpointStoreCloseFailed, "Close failed"),
        ]);

        assert_eq!(err.kind(), ErrorKind::SessionStopFailed);
        assert_eq!(
            err.kinds(),
            vec![
                ErrorKind::SessionStopFailed,
                ErrorKind::CheckpointStoreCloseFailed
            ]
        );
        assert_eq!(err.errors().map(<[CdcError]>::len), Some(2));
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn aggregate_of_one_is_unwrapped() {
        let err = CdcError::from(vec![cdc_error!(ErrorKind::InvalidData, "Bad data")]);

        assert!(err.errors().is_none());
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::other("broken pipe");
        let err: CdcError = io.into();

        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(
            error::Error::source(&err).map(ToString::to_string),
            Some("broken pipe".to_owned())
        );
    }

    #[test]
    fn bail_returns_early() {
        fn failing() -> CdcResult<()> {
            bail!(ErrorKind::ConnectorClosed, "Connector is closed");
        }

        assert_eq!(failing().unwrap_err().kind(), ErrorKind::ConnectorClosed);
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::SourceConnectionFailed.is_transient());
        assert!(!ErrorKind::AuthenticationError.is_transient());
        assert!(!ErrorKind::ConnectorClosed.is_transient());
    }
}
