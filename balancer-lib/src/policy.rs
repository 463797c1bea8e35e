//! Pluggable routing and recycling decisions.
//!
//! Policies are plain immutable values. A single instance can be shared by
//! any number of pools and slots through an [`Arc`](std::sync::Arc).
//!
//! Closures implement both traits, so ad-hoc policies need no new type:
//!
//! ```
//! use balancer_lib::policy::{AcceptPolicy, DropPolicy};
//!
//! let only_get = |request: &reqwest::Request| *request.method() == reqwest::Method::GET;
//! let on_retry_after = |headers: &http::HeaderMap| headers.contains_key("retry-after");
//!
//! let request = reqwest::Request::new(
//!     reqwest::Method::GET,
//!     "https://management.azure.com/".parse().unwrap(),
//! );
//! assert!(only_get.accepts(&request));
//! assert!(!on_retry_after.should_drop(&http::HeaderMap::new()));
//! ```

use http::HeaderMap;
use reqwest::Request;
use std::sync::Arc;

use crate::Destination;
use crate::ratelimit::remaining_quotas;

/// Decides whether a request may be sent through a pool at all
pub trait AcceptPolicy: Send + Sync {
    /// Returns `true` if the pool should serve `request`
    fn accepts(&self, request: &Request) -> bool;
}

/// Decides whether the connection that produced a response should be
/// replaced, judging only by the response headers
pub trait DropPolicy: Send + Sync {
    /// Returns `true` if the connection should be retired
    fn should_drop(&self, headers: &HeaderMap) -> bool;
}

impl<F> AcceptPolicy for F
where
    F: Fn(&Request) -> bool + Send + Sync,
{
    fn accepts(&self, request: &Request) -> bool {
        self(request)
    }
}

impl<F> DropPolicy for F
where
    F: Fn(&HeaderMap) -> bool + Send + Sync,
{
    fn should_drop(&self, headers: &HeaderMap) -> bool {
        self(headers)
    }
}

/// Shared accept policy as stored by pools
pub type SharedAcceptPolicy = Arc<dyn AcceptPolicy>;

/// Shared drop policy as stored by pools
pub type SharedDropPolicy = Arc<dyn DropPolicy>;

/// Accepts requests whose URL targets one [`Destination`].
///
/// This is the default accept policy of every pool. An absent port on
/// either the request or the destination matches any port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPolicy {
    destination: Destination,
}

impl DestinationPolicy {
    /// Accept requests for `destination`
    #[must_use]
    pub const fn new(destination: Destination) -> Self {
        Self { destination }
    }

    /// The destination requests are matched against
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }
}

impl AcceptPolicy for DestinationPolicy {
    fn accepts(&self, request: &Request) -> bool {
        let url = request.url();
        url.host_str()
            .is_some_and(|host| self.destination.matches(host, url.port()))
    }
}

/// Drops a connection as soon as any quota category reported on it falls
/// below a threshold.
///
/// This is the default drop policy of every pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaThresholdPolicy {
    prefix: String,
    threshold: u64,
}

impl QuotaThresholdPolicy {
    /// Drop when a header starting with `prefix` reports less than `threshold`
    #[must_use]
    pub fn new(prefix: impl Into<String>, threshold: u64) -> Self {
        Self {
            prefix: prefix.into(),
            threshold,
        }
    }

    /// The lowest remaining count that is still acceptable
    #[must_use]
    pub const fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl DropPolicy for QuotaThresholdPolicy {
    fn should_drop(&self, headers: &HeaderMap) -> bool {
        remaining_quotas(headers, &self.prefix).any(|(_, remaining)| remaining < self.threshold)
    }
}
