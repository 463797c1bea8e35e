//! In-memory transport for exercising pools without a network.
//!
//! Every [`MockTransport`] simulates one upstream instance with its own
//! quota: the first response reports `budget - 1` remaining, the next
//! `budget - 2`, and so on. The shared [`MockFactory`] counts opened,
//! closed, and concurrently live handles, and records any request that
//! reaches a handle after it was closed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Request, Response};

use crate::transport::{Transport, TransportFactory};
use crate::{Destination, ErrorKind, Result};

/// Header the mock reports its remaining quota in
pub(crate) const MOCK_QUOTA_HEADER: &str = "x-ms-ratelimit-remaining-mock-reads";

/// Header carrying the id of the handle that served a response
pub(crate) const MOCK_HANDLE_HEADER: &str = "x-mock-handle";

/// Build a plain `GET` request
pub(crate) fn get(url: &str) -> Request {
    Request::new(Method::GET, url.parse().expect("Expected valid URL"))
}

#[derive(Debug, Default)]
struct MockState {
    budget: u64,
    latency: Mutex<Duration>,
    retry_after_from: AtomicU64,
    fail_creates: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    used_after_close: AtomicUsize,
    served_per_closed_handle: Mutex<Vec<u64>>,
}

/// Factory handing out [`MockTransport`]s; clones share their counters
#[derive(Debug, Clone)]
pub(crate) struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    /// Each new handle starts with `budget` remaining requests
    pub(crate) fn with_budget(budget: u64) -> Self {
        Self {
            state: Arc::new(MockState {
                budget,
                ..MockState::default()
            }),
        }
    }

    /// Delay every exchange by `latency`
    pub(crate) fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    /// Add a `retry-after` header from the `nth` response of each handle on
    pub(crate) fn with_retry_after_from(self, nth: u64) -> Self {
        self.state.retry_after_from.store(nth, Ordering::SeqCst);
        self
    }

    /// Make subsequent `create` calls fail (or succeed again)
    pub(crate) fn fail_creates(&self, fail: bool) {
        self.state.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed
    pub(crate) fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Highest number of handles that were live at the same time
    pub(crate) fn peak_live(&self) -> usize {
        self.state.peak_live.load(Ordering::SeqCst)
    }

    /// Requests that reached a handle after it was closed
    pub(crate) fn used_after_close(&self) -> usize {
        self.state.used_after_close.load(Ordering::SeqCst)
    }

    /// Requests served by each closed handle, in closing order
    pub(crate) fn served_per_closed_handle(&self) -> Vec<u64> {
        self.state.served_per_closed_handle.lock().unwrap().clone()
    }
}

impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    fn create(&self, _destination: &Destination) -> Result<MockTransport> {
        if self.state.fail_creates.load(Ordering::SeqCst) {
            return Err(ErrorKind::transport("mock factory refused to open a handle"));
        }
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(MockTransport {
            id,
            state: Arc::clone(&self.state),
            served: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }
}

/// One simulated upstream connection
#[derive(Debug)]
pub(crate) struct MockTransport {
    id: usize,
    state: Arc<MockState>,
    served: AtomicU64,
    closed: AtomicBool,
}

impl MockTransport {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.state.used_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(ErrorKind::transport("handle used after close"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, _request: Request) -> Result<Response> {
        self.check_open()?;
        let latency = *self.state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_open()?;

        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.state.budget.saturating_sub(served);
        let mut response = http::Response::builder()
            .status(200)
            .header(MOCK_QUOTA_HEADER, remaining)
            .header(MOCK_HANDLE_HEADER, self.id);
        let retry_after_from = self.state.retry_after_from.load(Ordering::SeqCst);
        if retry_after_from > 0 && served >= retry_after_from {
            response = response.header(http::header::RETRY_AFTER, 1);
        }
        let response = response
            .body(String::new())
            .map_err(ErrorKind::transport)?;
        Ok(Response::from(response))
    }

    fn close_idle_connections(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state
            .served_per_closed_handle
            .lock()
            .unwrap()
            .push(self.served.load(Ordering::SeqCst));
        Ok(())
    }
}
