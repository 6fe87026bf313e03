use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::body::{RawBody, buffer_raw_body};
use crate::error::Error;
use crate::util::truncate_body;

/// Body of a terminal response.
///
/// Successful responses hand the transport's stream through untouched;
/// responses the engine had to inspect (QoS propagation) arrive buffered.
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(RawBody),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(body) => formatter
                .debug_tuple("ResponseBody::Buffered")
                .field(&body.len())
                .finish(),
            Self::Streaming(_) => formatter.write_str("ResponseBody::Streaming"),
        }
    }
}

/// The single terminal response observed by a caller.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Drains the body into owned bytes, closing any underlying stream.
    pub async fn into_bytes(self) -> Result<Bytes, Error> {
        match self.body {
            ResponseBody::Buffered(body) => Ok(body),
            ResponseBody::Streaming(body) => buffer_raw_body(body)
                .await
                .map_err(|source| Error::ReadBody { source }),
        }
    }

    pub async fn json<T>(self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let body = self.into_bytes().await?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&body),
        })
    }
}
