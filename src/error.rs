use http::Method;
use thiserror::Error;

use crate::classify::SerializableError;
use crate::transport::IoError;

/// Stable machine-readable error codes, one per [`Error`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    RetriesExhausted,
    RelocationsExhausted,
    BodyNotReplayable,
    Remote,
    UnknownRemote,
    Cancelled,
    Internal,
    InvalidUri,
    InvalidConfiguration,
    ReadBody,
    Deserialize,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::RelocationsExhausted => "relocations_exhausted",
            Self::BodyNotReplayable => "body_not_replayable",
            Self::Remote => "remote",
            Self::UnknownRemote => "unknown_remote",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::ReadBody => "read_body",
            Self::Deserialize => "deserialize",
        }
    }
}

/// Terminal outcome of a logical call, or a construction-time failure.
///
/// A call surfaces exactly one of these (or one success response) to its
/// caller; intermediate failures that were retried are only visible through
/// logging, except that the last suppressed IO cause is attached to
/// `RetriesExhausted`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("retries exhausted after {attempts} attempt(s) for {method} {uri}")]
    RetriesExhausted {
        method: Method,
        uri: String,
        attempts: usize,
        #[source]
        cause: Option<IoError>,
    },
    #[error("exceeded the maximum number of allowed redirects for {method} {uri}")]
    RelocationsExhausted { method: Method, uri: String },
    #[error("cannot retry a one-shot request body for {method} {uri}")]
    BodyNotReplayable { method: Method, uri: String },
    #[error("server returned error {status} for {method} {uri}: {error}")]
    Remote {
        status: u16,
        method: Method,
        uri: String,
        error: SerializableError,
    },
    #[error("server returned unexpected status {status} for {method} {uri}: {body}")]
    UnknownRemote {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("call was cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("internal invariant violation: {message}")]
    Internal { message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid client configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("failed to read response body")]
    ReadBody {
        #[source]
        source: IoError,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::RelocationsExhausted { .. } => ErrorCode::RelocationsExhausted,
            Self::BodyNotReplayable { .. } => ErrorCode::BodyNotReplayable,
            Self::Remote { .. } => ErrorCode::Remote,
            Self::UnknownRemote { .. } => ErrorCode::UnknownRemote,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidConfiguration { .. } => ErrorCode::InvalidConfiguration,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    /// The HTTP status the server answered with, for server-originated errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } | Self::UnknownRemote { status, .. } => Some(*status),
            _ => None,
        }
    }
}
