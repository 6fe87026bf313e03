//! `sturdy` is a resilient HTTP call engine for multi-server RPC clients.
//!
//! Given a configuration naming one or more equivalent base URLs, a client
//! issues each request to the currently preferred URL and transparently
//! retries or fails over on failure, honoring server QoS signals (308
//! redirect-to-other, 429 throttle, 503 unavailable), bounded relocations,
//! per-host adaptive concurrency limits, and exponential backoff with full
//! jitter.
//!
//! # Quick Start
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use sturdy::{Client, ClientConfiguration, Request};
//!
//! let config = ClientConfiguration::builder()
//!     .base_url("https://east.example.com/api")?
//!     .base_url("https://west.example.com/api")?
//!     .max_num_retries(4)
//!     .build()?;
//! let client = Client::new(config);
//!
//! let response = client
//!     .execute(Request::get("https://east.example.com/api/items")?)
//!     .await?;
//! let items = response.into_bytes().await?;
//!
//! println!("fetched {} bytes", items.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Behavior Summary
//!
//! - IO failures mark the URL unhealthy and fail over to the next base URL
//!   after a jittered backoff; read timeouts are not retried unless
//!   explicitly enabled.
//! - 429 responses retry the same URL, preferring the server's
//!   `Retry-After`; 503 responses fail over; 308 responses relocate
//!   immediately to the advertised base.
//! - Structured server errors (the JSON error envelope) and all other
//!   non-2xx responses are surfaced to the caller without retries.
//! - One-shot request bodies are never dispatched twice.

mod backoff;
mod body;
mod classify;
mod client;
mod clock;
mod config;
mod engine;
mod error;
mod hyper_transport;
mod limiter;
mod request;
mod response;
mod selector;
mod transport;
mod util;

pub use crate::body::{RawBody, RequestBody};
pub use crate::classify::SerializableError;
pub use crate::client::{CallHandle, Client, ClientBuilder};
pub use crate::clock::{Clock, SystemClock};
pub use crate::config::{
    ClientConfiguration, ClientConfigurationBuilder, NodeSelectionStrategy, RetryOnSocketException,
    RetryOnTimeout, ServerQos,
};
pub use crate::error::{Error, ErrorCode};
pub use crate::hyper_transport::{HyperTransport, HyperTransportBuilder};
pub use crate::limiter::ConcurrencyLimiterPolicy;
pub use crate::request::Request;
pub use crate::response::{Response, ResponseBody};
pub use crate::transport::{
    IoError, IoErrorKind, Transport, TransportFuture, TransportRequest, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;
