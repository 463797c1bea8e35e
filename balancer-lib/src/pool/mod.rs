//! Connection pools for a single destination.
//!
//! Two realizations share one contract, the [`Balancer`] trait:
//!
//! - [`RecyclingPool`] keeps a fixed array of slots and picks one per request
//!   round-robin. Each slot swaps its handle in place once the upstream
//!   reports that the handle's quota runs low.
//! - [`QueuePool`] hands out whole handles from a bounded ready queue. A
//!   background producer refills the queue whenever a handle is dropped.
//!
//! Both are created through [`PoolBuilder`].

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Request, Response};

use crate::{Destination, Result};

mod config;
mod event;
mod queue;
mod recycling;
mod slot;
mod stats;

pub use config::{
    DEFAULT_CAPACITY, DEFAULT_DESTINATION, DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE,
    DEFAULT_RECYCLE_THRESHOLD, PoolBuilder, PoolConfig,
};
pub use event::{RecycleEvent, RecycleObserver};
pub use queue::QueuePool;
pub use recycling::RecyclingPool;
pub use stats::{PoolStats, SlotStats};

/// Signal that makes a pending request give up, e.g. a timer or a
/// `oneshot` receiver mapped to `()`
pub type Cancel = BoxFuture<'static, ()>;

/// Anything that can route requests to one or more destinations
#[async_trait]
pub trait Balancer: Send + Sync {
    /// Send `request` through a connection handle of this balancer.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnsupportedDestination`](crate::ErrorKind::UnsupportedDestination)
    ///   if the request targets a destination this balancer does not serve
    /// - [`ErrorKind::PoolUnavailable`](crate::ErrorKind::PoolUnavailable)
    ///   after [`Balancer::shutdown`]
    /// - any transport error, unchanged
    async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_cancellable(request, futures::future::pending().boxed())
            .await
    }

    /// Like [`Balancer::execute`], but gives up with
    /// [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) as soon as
    /// `cancel` resolves.
    ///
    /// Cancelling only affects this request. Other requests on the same
    /// handle keep running and recycling is never blocked.
    ///
    /// # Errors
    ///
    /// See [`Balancer::execute`].
    async fn execute_cancellable(&self, request: Request, cancel: Cancel) -> Result<Response>;

    /// Destinations this balancer accepts requests for
    fn destinations(&self) -> Vec<Destination>;

    /// Stop accepting requests, wait for running ones, and close all handles.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Shutdown`](crate::ErrorKind::Shutdown) listing
    /// every handle that failed to close.
    async fn shutdown(&self) -> Result<()>;
}
