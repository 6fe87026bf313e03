use std::convert::Infallible;
use std::error::Error as StdError;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;

use crate::transport::{IoError, IoErrorKind};

pub(crate) type BoxBodyError = Box<dyn StdError + Send + Sync>;

/// Raw byte-stream body exchanged with the transport.
pub type RawBody = BoxBody<Bytes, BoxBodyError>;

/// A request body, distinguished by whether it can be dispatched again.
///
/// `Replayable` bodies are cloned for every attempt. A `OneShot` body is
/// consumed by its first dispatch; any retry that would re-send it converts
/// to a terminal error instead.
pub enum RequestBody {
    Empty,
    Replayable(Bytes),
    OneShot(RawBody),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn replayable(body: impl Into<Bytes>) -> Self {
        Self::Replayable(body.into())
    }

    /// Wraps a byte stream as a one-shot body.
    pub fn one_shot<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: StdError + Send + Sync + 'static,
    {
        Self::OneShot(BodyExt::boxed(StreamBody::new(stream.map(|item| {
            item.map(Frame::data)
                .map_err(|error| Box::new(error) as BoxBodyError)
        }))))
    }

    pub(crate) fn is_one_shot(&self) -> bool {
        matches!(self, Self::OneShot(_))
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("RequestBody::Empty"),
            Self::Replayable(body) => formatter
                .debug_tuple("RequestBody::Replayable")
                .field(&body.len())
                .finish(),
            Self::OneShot(_) => formatter.write_str("RequestBody::OneShot"),
        }
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxBodyError {
    match never {}
}

pub(crate) fn empty_raw_body() -> RawBody {
    Full::new(Bytes::new())
        .map_err(map_infallible_to_box_error)
        .boxed()
}

pub(crate) fn buffered_raw_body(body: Bytes) -> RawBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

/// Drains a raw body into owned bytes, consuming and closing the stream.
pub(crate) async fn buffer_raw_body(mut body: RawBody) -> Result<Bytes, IoError> {
    let mut collected = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| {
            IoError::new(IoErrorKind::Read, "failed to read response body").with_source(source)
        })?;
        if let Some(data) = frame.data_ref() {
            collected.extend_from_slice(data);
        }
    }
    Ok(Bytes::from(collected))
}
