//! Errors.

use std::fmt;
use std::io;

/// SQLSTATE reported when a query is cancelled by a `CancelRequest`.
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";
/// SQLSTATE reported when a statement runs inside an aborted transaction.
pub const SQLSTATE_IN_FAILED_SQL_TRANSACTION: &str = "25P02";
/// SQLSTATE reported when a named prepared statement no longer exists.
pub const SQLSTATE_INVALID_STATEMENT_NAME: &str = "26000";
/// SQLSTATE carried by cached-plan invalidation errors.
pub const SQLSTATE_FEATURE_NOT_SUPPORTED: &str = "0A000";

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not connect to server: {0}")]
    UnableToConnect(String),
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("connection rejected by server: {0}")]
    ConnectionRejected(String),
    #[error("connection has been closed")]
    ConnectionClosed,
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid value {value:?} for connection parameter {name:?}")]
    InvalidParameterValue { name: String, value: String },
    #[error("bind message length {0} exceeds the protocol maximum")]
    BindSizeExceeded(u64),
    #[error("operation not allowed in the current connection state: {0}")]
    WrongState(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error(transparent)]
    Server(Box<ServerError>),
    #[error("cached plan must not change result type")]
    CachedPlanMustNotChange(#[source] Box<ServerError>),
    #[error("prepared statement does not exist on the server")]
    InvalidStatementName(#[source] Box<ServerError>),
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedSqlTransaction(#[source] Box<ServerError>),
    #[error("row of {0} bytes exceeds the configured result buffer")]
    OutOfMemory(usize),
    #[error("operation interrupted")]
    Interrupted,
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
}

impl Error {
    /// Classify a parsed server error into the variant the executor routes on.
    /// Cached-plan invalidations get their own variants so the statement cache
    /// can bump its epoch and transparently re-parse on the next borrow.
    pub(crate) fn from_server(err: ServerError) -> Error {
        if err.code == SQLSTATE_INVALID_STATEMENT_NAME
            || err.message.contains("invalid prepared statement name")
        {
            return Error::InvalidStatementName(Box::new(err));
        }
        if let Some(routine) = &err.routine {
            if routine == "RevalidateCachedQuery" || routine == "RevalidateCachedPlan" {
                return Error::CachedPlanMustNotChange(Box::new(err));
            }
        }
        if err.message.contains("cached plan must not change result type") {
            return Error::CachedPlanMustNotChange(Box::new(err));
        }
        Error::Server(Box::new(err))
    }

    /// Whether a retry after a transparent re-parse can heal this error.
    pub fn heals_via_reparse(&self) -> bool {
        matches!(
            self,
            Error::CachedPlanMustNotChange(_) | Error::InvalidStatementName(_)
        )
    }

    /// The parsed server error carried by this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(err)
            | Error::CachedPlanMustNotChange(err)
            | Error::InvalidStatementName(err)
            | Error::InFailedSqlTransaction(err) => Some(err),
            _ => None,
        }
    }

    /// True when the failure means the socket can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::ConnectionFailure(_)
                | Error::ProtocolViolation(_)
                | Error::Timeout
        )
    }
}

/// A parsed `ErrorResponse` / `NoticeResponse` payload.
///
/// The same field layout serves errors and warnings; the severity tells them
/// apart. `include_detail` mirrors the `logServerErrorDetail` connection
/// parameter: when false, the DETAIL field is withheld from the user-facing
/// message (it may echo data values).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_context: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
    pub include_detail: bool,
    /// Errors within one batch chain in submission order.
    pub next: Option<Box<ServerError>>,
}

impl ServerError {
    pub fn new(severity: &str, code: &str, message: &str) -> ServerError {
        ServerError {
            severity: severity.into(),
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            where_context: None,
            file: None,
            line: None,
            routine: None,
            include_detail: true,
            next: None,
        }
    }

    /// Append `err` to the end of the chain, preserving submission order.
    pub fn chain(&mut self, err: ServerError) {
        let mut tail = self;
        while tail.next.is_some() {
            tail = tail.next.as_mut().unwrap();
        }
        tail.next = Some(Box::new(err));
    }

    pub fn is_warning(&self) -> bool {
        self.severity == "WARNING" || self.severity == "NOTICE" || self.severity == "INFO"
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity, self.message, self.code
        )?;
        if self.include_detail {
            if let Some(detail) = &self.detail {
                write!(f, "; Detail: {detail}")?;
            }
        }
        if let Some(hint) = &self.hint {
            write!(f, "; Hint: {hint}")?;
        }
        if let Some(position) = self.position {
            write!(f, "; Position: {position}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Error {
        Error::from_server(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_statement_name() {
        let err = ServerError::new(
            "ERROR",
            SQLSTATE_INVALID_STATEMENT_NAME,
            "prepared statement \"S_1\" does not exist",
        );
        let err = Error::from_server(err);
        assert!(matches!(err, Error::InvalidStatementName(_)));
        assert!(err.heals_via_reparse());
    }

    #[test]
    fn classifies_cached_plan_by_routine() {
        let mut err = ServerError::new(
            "ERROR",
            SQLSTATE_FEATURE_NOT_SUPPORTED,
            "cached plan must not change result type",
        );
        err.routine = Some("RevalidateCachedQuery".into());
        assert!(matches!(
            Error::from_server(err),
            Error::CachedPlanMustNotChange(_)
        ));
    }

    #[test]
    fn ordinary_server_error_is_not_heal_via_reparse() {
        let err = ServerError::new("ERROR", "42601", "syntax error at or near \"SELEC\"");
        let err = Error::from_server(err);
        assert!(matches!(err, Error::Server(_)));
        assert!(!err.heals_via_reparse());
    }

    #[test]
    fn display_honors_include_detail() {
        let mut err = ServerError::new("ERROR", "23505", "duplicate key value");
        err.detail = Some("Key (id)=(1) already exists.".into());
        assert!(err.to_string().contains("Detail"));
        err.include_detail = false;
        assert!(!err.to_string().contains("Detail"));
    }

    #[test]
    fn chain_preserves_order() {
        let mut first = ServerError::new("ERROR", "42601", "first");
        first.chain(ServerError::new("ERROR", "42601", "second"));
        first.chain(ServerError::new("ERROR", "42601", "third"));
        assert_eq!(first.next.as_ref().unwrap().message, "second");
        assert_eq!(
            first.next.as_ref().unwrap().next.as_ref().unwrap().message,
            "third"
        );
    }
}
