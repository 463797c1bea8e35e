//! Per-connection quota tracking.
//!
//! Rate-limited upstreams such as Azure Resource Manager report the
//! remaining quota of the instance that served a request in response
//! headers. Because a multiplexed connection keeps talking to the same
//! instance, these headers describe the health of the connection itself.
//!
//! - [`RateLimitTracker`]: accumulates the headers seen on one handle
//! - [`RateLimitSnapshot`]: a point-in-time copy of the tracked categories

mod headers;
mod tracker;

pub use headers::DEFAULT_HEADER_PREFIX;
pub(crate) use headers::remaining_quotas;
pub use tracker::{RateLimitSnapshot, RateLimitTracker};
