use std::time::Duration;

use http::{Request as HttpRequest, Uri};
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::body::BoxBodyError;
use crate::transport::{IoError, IoErrorKind, Transport, TransportFuture, TransportRequest, TransportResponse};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

type RustlsHyperClient = HyperClient<HttpsConnector<HttpConnector>, crate::body::RawBody>;

pub struct HyperTransportBuilder {
    request_timeout: Duration,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl HyperTransportBuilder {
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn build(self) -> HyperTransport {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(self.connect_timeout));
        connector.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build(https);
        HyperTransport {
            client,
            request_timeout: self.request_timeout,
        }
    }
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }
}

/// Default [`Transport`] backed by hyper's pooled client with rustls.
///
/// Connect timeouts are enforced by the connector and surface as
/// [`IoErrorKind::ConnectTimeout`]; the per-attempt request timeout covers
/// the window up to response headers and surfaces as
/// [`IoErrorKind::ReadTimeout`].
pub struct HyperTransport {
    client: RustlsHyperClient,
    request_timeout: Duration,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let client = self.client.clone();
        let request_timeout = self.request_timeout;
        Box::pin(async move {
            let uri: Uri = request.url.as_str().parse().map_err(|_| {
                IoError::new(IoErrorKind::Other, "request url is not a valid http uri")
            })?;
            let mut request_builder = HttpRequest::builder().method(request.method).uri(uri);
            for (name, value) in &request.headers {
                request_builder = request_builder.header(name, value);
            }
            let http_request = request_builder.body(request.body).map_err(|source| {
                IoError::new(IoErrorKind::Other, "failed to build http request")
                    .with_source(Box::new(source) as BoxBodyError)
            })?;

            match tokio::time::timeout(request_timeout, client.request(http_request)).await {
                Ok(Ok(response)) => {
                    let (parts, body) = response.into_parts();
                    Ok(TransportResponse::new(
                        parts.status,
                        parts.headers,
                        body.map_err(|source| Box::new(source) as BoxBodyError)
                            .boxed(),
                    ))
                }
                Ok(Err(source)) => Err(classify_hyper_error(&source)
                    .with_source(Box::new(source) as BoxBodyError)),
                Err(_) => Err(IoError::new(
                    IoErrorKind::ReadTimeout,
                    format!(
                        "no response headers within {}ms",
                        request_timeout.as_millis()
                    ),
                )),
            }
        })
    }
}

fn classify_hyper_error(error: &hyper_util::client::legacy::Error) -> IoError {
    let connecting = error.is_connect();
    let kind = classify_error_chain(error, connecting);
    let message = if connecting {
        "failed to establish a connection"
    } else {
        "connection failed during the exchange"
    };
    IoError::new(kind, message)
}

/// Classifies a failure by its cause chain rather than its wording. With the
/// connector shipped here (hyper-util's TCP connector under rustls), TLS
/// problems downcast to `rustls::Error`, socket-level problems bottom out in
/// a `std::io::Error` with a meaningful kind, and only resolver failures
/// have to be recognized by message.
fn classify_error_chain(
    error: &(dyn std::error::Error + 'static),
    connecting: bool,
) -> IoErrorKind {
    let mut socket_kind = None;
    if let Some(kind) = scan_causes(error, &mut socket_kind) {
        return kind;
    }

    use std::io::ErrorKind;
    match socket_kind {
        Some(ErrorKind::TimedOut) if connecting => IoErrorKind::ConnectTimeout,
        Some(ErrorKind::TimedOut) => IoErrorKind::ReadTimeout,
        Some(
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable,
        ) => IoErrorKind::Connect,
        Some(
            ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero,
        ) => IoErrorKind::Read,
        // A handshake failure flattened into io before reaching us.
        Some(ErrorKind::InvalidData) => IoErrorKind::Tls,
        // Anything unrecognized on the connect path never carried request
        // bytes, so treating it as a connect failure keeps it retryable.
        _ if connecting => IoErrorKind::Connect,
        _ => IoErrorKind::Other,
    }
}

/// Returns early on a definite signal (TLS, DNS) and otherwise records the
/// deepest socket error kind seen. `std::io::Error` hides its custom payload
/// from `source()`, so the payload behind `get_ref` is scanned explicitly.
fn scan_causes(
    error: &(dyn std::error::Error + 'static),
    socket_kind: &mut Option<std::io::ErrorKind>,
) -> Option<IoErrorKind> {
    if error.downcast_ref::<rustls::Error>().is_some() {
        return Some(IoErrorKind::Tls);
    }
    if let Some(io) = error.downcast_ref::<std::io::Error>() {
        if is_resolver_failure(io) {
            return Some(IoErrorKind::Dns);
        }
        *socket_kind = Some(io.kind());
        if let Some(payload) = io.get_ref() {
            let payload = payload as &(dyn std::error::Error + 'static);
            if let Some(kind) = scan_causes(payload, socket_kind) {
                return Some(kind);
            }
        }
    }
    error
        .source()
        .and_then(|source| scan_causes(source, socket_kind))
}

/// getaddrinfo failures carry no usable `ErrorKind`; the platform message is
/// the only signal ("failed to lookup address information" on glibc,
/// "nodename nor servname provided" on the BSDs).
fn is_resolver_failure(io: &std::io::Error) -> bool {
    let text = io.to_string().to_ascii_lowercase();
    text.contains("lookup address")
        || text.contains("name resolution")
        || text.contains("nodename")
        || text.contains("no such host")
}
