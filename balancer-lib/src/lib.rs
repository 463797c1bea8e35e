//! `balancer_lib` spreads requests to a rate-limited HTTP upstream over
//! several independent connections and replaces a connection before the
//! upstream instance behind it starts throttling.
//!
//! Upstreams such as Azure Resource Manager report the remaining quota of
//! the instance that served a request in response headers
//! (`x-ms-ratelimit-remaining-*`). With HTTP/2 a client keeps talking to the
//! same instance over one multiplexed connection, so it can exhaust that
//! instance although the service as a whole has capacity left. A pool keeps
//! `capacity` connection handles, watches those headers, and recycles a
//! handle once its quota falls below a threshold. Requests still running on
//! the old handle finish on it before it is closed.
//!
//! ```no_run
//! use balancer_lib::{Balancer, PoolBuilder, PoolConfig, ReqwestFactory, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = PoolBuilder::builder()
//!         .config(PoolConfig::default())
//!         .build()
//!         .recycling_pool(ReqwestFactory::default())?;
//!
//!     let request = reqwest::Request::new(
//!         reqwest::Method::GET,
//!         "https://management.azure.com/subscriptions?api-version=2022-12-01"
//!             .parse()
//!             .unwrap(),
//!     );
//!     let response = pool.execute(request).await?;
//!     println!("{}", response.status());
//!
//!     println!("{}", pool.stats().summary());
//!     pool.shutdown().await
//! }
//! ```
//!
//! Several destinations can be served side by side through a [`Router`].
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    rustdoc::invalid_html_tags,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    variant_size_differences,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

#[cfg(doctest)]
doc_comment::doctest!("../../README.md");

mod types;

pub mod policy;
pub mod pool;
pub mod ratelimit;
pub mod router;
pub mod transport;
pub mod waiter;

#[cfg(test)]
pub(crate) mod test_utils;

// Only referenced for its `vendored` feature
#[cfg(feature = "native-tls")]
use openssl_sys as _;

pub use crate::{
    policy::{AcceptPolicy, DestinationPolicy, DropPolicy, QuotaThresholdPolicy},
    pool::{
        Balancer, Cancel, PoolBuilder, PoolConfig, PoolStats, QueuePool, RecycleEvent,
        RecycleObserver, RecyclingPool, SlotStats,
    },
    ratelimit::{RateLimitSnapshot, RateLimitTracker},
    router::{Router, RouterBuilder, SharedBalancer},
    transport::{ReqwestFactory, ReqwestTransport, Transport, TransportFactory},
    types::{DEFAULT_PORT, Destination, ErrorKind, Result},
};
