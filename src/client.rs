use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::clock::{Clock, SystemClock};
use crate::config::{
    ClientConfiguration, NodeSelectionStrategy, RetryOnSocketException, RetryOnTimeout, ServerQos,
};
use crate::engine::execute_call;
use crate::error::Error;
use crate::hyper_transport::HyperTransport;
use crate::limiter::ConcurrencyLimiters;
use crate::request::Request;
use crate::response::Response;
use crate::selector::UrlSelector;
use crate::transport::Transport;

/// Cancellation token for one logical call.
///
/// Cancelling flips an absorbing flag: the call dispatches no further
/// attempts, drops whatever it was waiting on, and surfaces a single
/// `Cancelled` error even if a response arrived concurrently.
#[derive(Clone, Default)]
pub struct CallHandle {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CallHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct ClientShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) selector: UrlSelector,
    pub(crate) limiters: ConcurrencyLimiters,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) server_qos: ServerQos,
    pub(crate) retry_on_timeout: RetryOnTimeout,
    pub(crate) retry_on_socket_exception: RetryOnSocketException,
    pub(crate) node_selection_strategy: NodeSelectionStrategy,
    pub(crate) max_num_retries: usize,
    pub(crate) backoff_slot_size: Duration,
    pub(crate) max_num_relocations: usize,
}

pub struct ClientBuilder {
    config: ClientConfiguration,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
}

impl ClientBuilder {
    fn new(config: ClientConfiguration) -> Self {
        Self {
            config,
            transport: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn clock_arc(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock<C>(self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock_arc(Arc::new(clock))
    }

    pub fn build(self) -> Client {
        let config = self.config;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new()));
        Client {
            shared: Arc::new(ClientShared {
                transport,
                selector: UrlSelector::new(config.base_urls, config.failed_url_cooldown),
                limiters: ConcurrencyLimiters::new(config.concurrency_limiter),
                clock: self.clock,
                server_qos: config.server_qos,
                retry_on_timeout: config.retry_on_timeout,
                retry_on_socket_exception: config.retry_on_socket_exception,
                node_selection_strategy: config.node_selection_strategy,
                max_num_retries: config.max_num_retries,
                backoff_slot_size: config.backoff_slot_size,
                max_num_relocations: config.max_num_relocations,
            }),
        }
    }
}

/// A multi-server HTTP client. Cheap to clone; all clones share URL health,
/// limiter state, and the transport.
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<ClientShared>,
}

impl Client {
    pub fn builder(config: ClientConfiguration) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Builds a client over the default hyper transport.
    pub fn new(config: ClientConfiguration) -> Self {
        Self::builder(config).build()
    }

    /// Executes one logical call to completion: exactly one success response
    /// or one error, with retries and failover handled internally.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        let handle = CallHandle::new();
        execute_call(&self.shared, request, &handle).await
    }

    /// Like [`execute`](Self::execute), but cancellable through the given
    /// handle.
    pub async fn execute_with_handle(
        &self,
        request: Request,
        handle: &CallHandle,
    ) -> Result<Response, Error> {
        execute_call(&self.shared, request, handle).await
    }

    pub fn cancel(&self, handle: &CallHandle) {
        handle.cancel();
    }
}
