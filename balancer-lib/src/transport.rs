//! Physical connection handles.
//!
//! A pool never talks to the network itself. It asks a [`TransportFactory`]
//! for handles, sends requests through them, and closes them when they are
//! retired. Each handle must own its own connections, otherwise recycling
//! it would not land requests on a different upstream instance.
//!
//! [`ReqwestFactory`] is the default: it builds one [`reqwest::Client`] per
//! handle, each with its own connection pool.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use http::header::{self, HeaderValue};
use reqwest::{Request, Response};
use typed_builder::TypedBuilder;

use crate::{Destination, ErrorKind, Result};

/// Default timeout for a single exchange, 30 seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent, `balancer/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("balancer/", env!("CARGO_PKG_VERSION"));

/// One independent connection (or set of connections) to the upstream
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` and wait for the response head.
    ///
    /// # Errors
    ///
    /// Transport failures are passed to the caller unchanged.
    async fn execute(&self, request: Request) -> Result<Response>;

    /// Release idle connections. Called once, after the handle has drained.
    ///
    /// # Errors
    ///
    /// Failures are logged by the pool and never affect requests.
    fn close_idle_connections(&self) -> Result<()>;
}

/// Creates fresh [`Transport`] handles for one destination
pub trait TransportFactory: Send + Sync + 'static {
    /// The handle type produced by this factory
    type Transport: Transport;

    /// Open a new, independent handle to `destination`
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be set up. Pools keep their old
    /// handle and try again later.
    fn create(&self, destination: &Destination) -> Result<Self::Transport>;
}

/// Builds one [`reqwest::Client`] per connection handle.
///
/// At most one idle connection per host is kept. Over HTTP/2 a handle
/// therefore multiplexes its requests on one connection. Over HTTP/1.1 the
/// client still opens a connection per concurrent request, so only the idle
/// count is bounded there. All of them are dropped together on recycle.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `ReqwestFactory`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `ReqwestFactory`.
"))]
pub struct ReqwestFactory {
    /// User-agent sent with every request
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)")]
    user_agent: String,

    /// Headers added to every request unless the request sets them itself
    headers: HeaderMap,

    /// Timeout for a whole exchange
    #[builder(default = Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))]
    timeout: Option<Duration>,

    /// Skip ALPN and speak HTTP/2 right away
    http2_prior_knowledge: bool,

    /// Accept invalid TLS certificates, e.g. for local test upstreams
    allow_insecure: bool,
}

impl Default for ReqwestFactory {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReqwestFactory {
    fn client(&self) -> Result<reqwest::Client> {
        let mut headers = self.headers.clone();
        let user_agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| ErrorKind::InvalidConfig(format!("invalid user agent: {e}")))?;
        headers.insert(header::USER_AGENT, user_agent);

        let builder = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .pool_max_idle_per_host(1)
            .danger_accept_invalid_certs(self.allow_insecure);

        let builder = match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        };
        let builder = if self.http2_prior_knowledge {
            builder.http2_prior_knowledge()
        } else {
            builder
        };

        builder.build().map_err(ErrorKind::BuildRequestClient)
    }
}

impl TransportFactory for ReqwestFactory {
    type Transport = ReqwestTransport;

    fn create(&self, destination: &Destination) -> Result<ReqwestTransport> {
        log::trace!("Opening new client for {destination}");
        Ok(ReqwestTransport::new(self.client()?))
    }
}

/// A connection handle backed by its own [`reqwest::Client`].
///
/// Closing drops the client. Connections still used by a response body
/// stay open until that body is consumed.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: Mutex<Option<reqwest::Client>>,
}

impl ReqwestTransport {
    /// Wrap an existing client
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self {
            client: Mutex::new(Some(client)),
        }
    }

    fn client(&self) -> Option<reqwest::Client> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        let client = self.client().ok_or(ErrorKind::PoolUnavailable)?;
        client
            .execute(request)
            .await
            .map_err(ErrorKind::NetworkRequest)
    }

    fn close_idle_connections(&self) -> Result<()> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
