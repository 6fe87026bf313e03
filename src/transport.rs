use std::future::Future;
use std::pin::Pin;

use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::body::{BoxBodyError, RawBody};

/// One network dispatch handed to the transport.
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RawBody,
}

/// The transport's answer: status line, headers, and a streaming body.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RawBody,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: RawBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// IO-class failure categories, distinguished structurally so the engine
/// never has to sniff error messages to tell a connect timeout from a read
/// timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoErrorKind {
    Dns,
    Connect,
    ConnectTimeout,
    Read,
    ReadTimeout,
    Tls,
    Other,
}

impl IoErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::ConnectTimeout => "connect_timeout",
            Self::Read => "read",
            Self::ReadTimeout => "read_timeout",
            Self::Tls => "tls",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for IoErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// A transport-level failure for a single attempt.
#[derive(Debug, Error)]
#[error("{kind} error: {message}")]
pub struct IoError {
    kind: IoErrorKind,
    message: String,
    #[source]
    source: Option<BoxBodyError>,
}

impl IoError {
    pub fn new(kind: IoErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxBodyError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub const fn kind(&self) -> IoErrorKind {
        self.kind
    }
}

pub type TransportFuture = Pin<Box<dyn Future<Output = Result<TransportResponse, IoError>> + Send>>;

/// The HTTP transport seam. Implementations own connection pooling, TLS, and
/// protocol framing; the call engine only needs a cancellable dispatch that
/// reports IO failures with a structural [`IoErrorKind`].
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> TransportFuture;
}
