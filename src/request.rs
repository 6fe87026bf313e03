use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::body::RequestBody;
use crate::error::Error;

/// A single logical user request.
///
/// The URL is absolute and must be rooted under one of the configured base
/// URLs; the engine rebases its path onto whichever base the selector
/// currently prefers, so any of the configured bases is a valid authority to
/// address the request to. A URL outside every base is rejected before
/// dispatch.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn try_new(method: Method, url: &str) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|_| Error::InvalidUri {
            uri: url.to_owned(),
        })?;
        Ok(Self::new(method, url))
    }

    pub fn get(url: &str) -> Result<Self, Error> {
        Self::try_new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self, Error> {
        Self::try_new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name: HeaderName = name.parse().map_err(|_| Error::InvalidConfiguration {
            message: format!("invalid header name: {name}"),
        })?;
        let value: HeaderValue = value.parse().map_err(|_| Error::InvalidConfiguration {
            message: format!("invalid header value for {name}"),
        })?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn into_parts(self) -> (Method, Url, HeaderMap, RequestBody) {
        (self.method, self.url, self.headers, self.body)
    }
}
