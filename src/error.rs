//! Error taxonomy
//!
//! Every failure a client can observe is one of these types. Each maps to a
//! numeric status code sent on the wire as `>> ERR: [code] message`.

use thiserror::Error;

use crate::types::EndpointFailure;

/// Malformed command, document or query. Always recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Bad arguments for {command}: {reason}")]
    BadArguments { command: String, reason: String },

    #[error("Invalid number for {clause}: {token:?}")]
    InvalidNumber { clause: String, token: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl ParseError {
    pub fn bad_arguments(command: &str, reason: impl Into<String>) -> Self {
        Self::BadArguments {
            command: command.to_uppercase(),
            reason: reason.into(),
        }
    }
}

/// Failure turning an endpoint token into a live backend handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("No such database: {0}")]
    NoSuchDatabase(String),

    #[error("Endpoint unreachable: {endpoint} ({reason})")]
    EndpointUnreachable { endpoint: String, reason: String },

    #[error("Invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Semantically invalid request, detected before any backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid field name: {0:?}")]
    InvalidFieldName(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),
}

/// Failure reported by a single backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Backend is closed")]
    Closed,
}

impl From<sled::Error> for BackendError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Any error a command can produce
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("You must select a database first (USING or CREATE)")]
    NoEndpointSelected,

    #[error("Search failed on every endpoint: {}", join_failures(.0))]
    SearchFailed(Vec<EndpointFailure>),

    #[error("{}", describe_fanout_failure(.failed, .total))]
    FanOutFailed {
        failed: Vec<EndpointFailure>,
        total: usize,
    },
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_fanout_failure(failed: &[EndpointFailure], total: &usize) -> String {
    format!(
        "Failed on {} of {} endpoints: {}",
        failed.len(),
        total,
        join_failures(failed)
    )
}

/// Numeric status codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    NotAllowed,
    Internal,
    Unreachable,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::NotAllowed => 405,
            Self::Internal => 500,
            Self::Unreachable => 502,
        }
    }
}

impl CommandError {
    /// Status code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(ParseError::UnknownCommand(_)) => ErrorCode::NotFound,
            Self::Parse(_) | Self::Validation(_) => ErrorCode::BadRequest,
            Self::Resolution(ResolutionError::NoSuchDatabase(_)) => ErrorCode::NotFound,
            Self::Resolution(ResolutionError::InvalidEndpoint { .. }) => ErrorCode::BadRequest,
            Self::Resolution(ResolutionError::EndpointUnreachable { .. }) => ErrorCode::Unreachable,
            Self::NoEndpointSelected => ErrorCode::NotAllowed,
            Self::SearchFailed(_) | Self::FanOutFailed { .. } => ErrorCode::Internal,
        }
    }
}
