use serde::{Deserialize, Serialize};
use std::sync::Arc;
use typed_builder::TypedBuilder;

use super::event::RecycleObserver;
use super::queue::QueuePool;
use super::recycling::RecyclingPool;
use crate::policy::{DestinationPolicy, QuotaThresholdPolicy, SharedAcceptPolicy, SharedDropPolicy};
use crate::ratelimit::DEFAULT_HEADER_PREFIX;
use crate::transport::TransportFactory;
use crate::{Destination, ErrorKind, Result};

/// Default upstream, the Azure Resource Manager endpoint
pub const DEFAULT_DESTINATION: &str = "management.azure.com:443";

/// Default number of connection handles per destination
pub const DEFAULT_CAPACITY: usize = 8;

/// Default lowest acceptable remaining quota before a handle is recycled
pub const DEFAULT_RECYCLE_THRESHOLD: u64 = 100;

/// Default number of requests a handle must serve before it may be recycled
pub const DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE: u64 = 10;

/// Settings of a single pool.
///
/// Every field has a default, so a TOML table only needs to list what it
/// changes:
///
/// ```
/// use balancer_lib::PoolConfig;
///
/// let config: PoolConfig = toml::from_str("capacity = 4").unwrap();
/// assert_eq!(config.capacity, 4);
/// assert_eq!(config.destination.to_string(), "management.azure.com:443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Upstream `host[:port]` all requests of this pool must target
    #[serde(default = "default_destination")]
    pub destination: Destination,

    /// Number of connection handles kept per destination
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// A handle whose lowest remaining quota drops below this is recycled
    #[serde(default = "default_recycle_threshold")]
    pub recycle_threshold: u64,

    /// Handles that served fewer requests are never recycled
    #[serde(default = "default_min_requests_before_recycle")]
    pub min_requests_before_recycle: u64,

    /// Common prefix of the remaining-quota response headers
    #[serde(default = "default_header_prefix")]
    pub header_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            capacity: DEFAULT_CAPACITY,
            recycle_threshold: DEFAULT_RECYCLE_THRESHOLD,
            min_requests_before_recycle: DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE,
            header_prefix: default_header_prefix(),
        }
    }
}

fn default_destination() -> Destination {
    Destination::new("management.azure.com", Some(443))
}

const fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

const fn default_recycle_threshold() -> u64 {
    DEFAULT_RECYCLE_THRESHOLD
}

const fn default_min_requests_before_recycle() -> u64 {
    DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE
}

fn default_header_prefix() -> String {
    DEFAULT_HEADER_PREFIX.to_string()
}

impl PoolConfig {
    /// Default settings for another destination
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidDestination`] if `destination` is not a
    /// valid `host[:port]` string.
    pub fn for_destination(destination: &str) -> Result<Self> {
        Ok(Self {
            destination: destination.parse()?,
            ..Self::default()
        })
    }

    /// Reject settings no pool can work with
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] for a zero capacity or an empty
    /// header prefix.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ErrorKind::InvalidConfig(
                "capacity must be at least 1".into(),
            ));
        }
        if self.header_prefix.is_empty() {
            return Err(ErrorKind::InvalidConfig(
                "header prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Everything a pool and its slots need at request time
pub(crate) struct Settings {
    pub(crate) destination: Destination,
    /// Lowest acceptable quota seen by a handle's tracker. Unset when a
    /// custom drop policy takes over the recycle decision.
    pub(crate) recycle_threshold: Option<u64>,
    pub(crate) min_requests_before_recycle: u64,
    pub(crate) header_prefix: Arc<str>,
    pub(crate) accept_policy: SharedAcceptPolicy,
    pub(crate) drop_policy: SharedDropPolicy,
    pub(crate) observer: Option<RecycleObserver>,
}

impl Settings {
    /// Fail with a routing error if the accept policy rejects `request`
    pub(crate) fn admit(&self, request: &reqwest::Request) -> Result<()> {
        if self.accept_policy.accepts(request) {
            return Ok(());
        }
        let url = request.url();
        let requested = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => url.to_string(),
        };
        Err(ErrorKind::UnsupportedDestination {
            requested,
            supported: vec![self.destination.to_string()],
        })
    }

    /// Whether a handle's state calls for recycling it
    pub(crate) fn recycle_due(&self, served: u64, minimum: Option<u64>, flagged: bool) -> bool {
        let below_threshold = self
            .recycle_threshold
            .zip(minimum)
            .is_some_and(|(threshold, remaining)| remaining < threshold);
        served >= self.min_requests_before_recycle && (flagged || below_threshold)
    }
}

/// Assembles a pool from a [`PoolConfig`] and optional policies.
///
/// Without explicit policies, requests are accepted by
/// [`DestinationPolicy`] and handles are dropped by
/// [`QuotaThresholdPolicy`] using the configured threshold and prefix.
///
/// ```no_run
/// # use balancer_lib::{PoolBuilder, PoolConfig, ReqwestFactory};
/// # #[tokio::main]
/// # async fn main() -> balancer_lib::Result<()> {
/// let pool = PoolBuilder::builder()
///     .config(PoolConfig::for_destination("management.azure.com")?)
///     .observer(std::sync::Arc::new(|event: &balancer_lib::RecycleEvent| {
///         println!("{event}");
///     }))
///     .build()
///     .recycling_pool(ReqwestFactory::default())?;
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
Create a builder for building `PoolBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `PoolBuilder`.
"))]
pub struct PoolBuilder {
    /// Pool settings, defaults if omitted
    #[builder(default)]
    config: PoolConfig,

    /// Replaces the default [`DestinationPolicy`]
    #[builder(default, setter(strip_option))]
    accept_policy: Option<SharedAcceptPolicy>,

    /// Replaces the default [`QuotaThresholdPolicy`]. The configured
    /// `recycle_threshold` is then ignored and only this policy and
    /// `min_requests_before_recycle` decide when a handle is recycled.
    #[builder(default, setter(strip_option))]
    drop_policy: Option<SharedDropPolicy>,

    /// Called after every completed recycle
    #[builder(default, setter(strip_option))]
    observer: Option<RecycleObserver>,
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .field("custom_accept_policy", &self.accept_policy.is_some())
            .field("custom_drop_policy", &self.drop_policy.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl PoolBuilder {
    /// Build a pool of fixed slots that recycle their handles in place.
    ///
    /// All handles are opened before this returns.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings, outside a Tokio runtime, or when the
    /// factory cannot open the initial handles.
    pub fn recycling_pool<F: TransportFactory>(self, factory: F) -> Result<RecyclingPool<F>> {
        let capacity = self.config.capacity;
        RecyclingPool::new(self.settings()?, capacity, factory)
    }

    /// Build a pool that hands out handles from a bounded ready queue.
    ///
    /// Handles are opened in the background as capacity allows.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings or outside a Tokio runtime.
    pub fn queue_pool<F: TransportFactory>(self, factory: F) -> Result<QueuePool<F>> {
        let capacity = self.config.capacity;
        QueuePool::new(self.settings()?, capacity, factory)
    }

    pub(crate) fn settings(self) -> Result<Settings> {
        self.config.validate()?;
        let PoolConfig {
            destination,
            recycle_threshold,
            min_requests_before_recycle,
            header_prefix,
            ..
        } = self.config;

        let tracked_threshold = self.drop_policy.is_none().then_some(recycle_threshold);
        let accept_policy = self
            .accept_policy
            .unwrap_or_else(|| Arc::new(DestinationPolicy::new(destination.clone())));
        let drop_policy = self.drop_policy.unwrap_or_else(|| {
            Arc::new(QuotaThresholdPolicy::new(
                header_prefix.clone(),
                recycle_threshold,
            ))
        });

        Ok(Settings {
            destination,
            recycle_threshold: tracked_threshold,
            min_requests_before_recycle,
            header_prefix: header_prefix.into(),
            accept_policy,
            drop_policy,
            observer: self.observer,
        })
    }
}
