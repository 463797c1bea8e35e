use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, trace, warn};
use reqwest::{Request, Response};
use tokio::sync::{Notify, watch};

use super::config::Settings;
use super::event::RecycleEvent;
use super::stats::SlotStats;
use crate::ratelimit::RateLimitTracker;
use crate::transport::{Transport, TransportFactory};
use crate::waiter::{WaitGroup, WaitGuard};
use crate::{ErrorKind, Result};

/// One transport handle plus everything observed while it was current.
///
/// Never mutated in place by a recycle; the slot installs a new one instead.
struct Handle<T> {
    transport: T,
    tracker: RateLimitTracker,
    served: AtomicU64,
    in_flight: AtomicUsize,
    drop_requested: AtomicBool,
    opened: Instant,
}

/// The handle new requests go to, with the means to drain it later
struct Current<T> {
    handle: Arc<Handle<T>>,
    guard: WaitGuard,
    waiter: WaitGroup,
}

impl<T> Current<T> {
    fn open(transport: T, header_prefix: Arc<str>) -> Self {
        let (waiter, guard) = WaitGroup::new();
        Self {
            handle: Arc::new(Handle {
                transport,
                tracker: RateLimitTracker::new(header_prefix),
                served: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                drop_requested: AtomicBool::new(false),
                opened: Instant::now(),
            }),
            guard,
            waiter,
        }
    }
}

/// Releases a request's claim on a handle, also when the request is cancelled
struct InFlight<T> {
    handle: Arc<Handle<T>>,
    _guard: WaitGuard,
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        self.handle.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A fixed position in a [`RecyclingPool`](super::RecyclingPool) owning
/// exactly one live handle at a time.
///
/// The lock only guards reading and replacing the current handle. Requests
/// run outside of it, and a background task started by the pool swaps
/// handles whenever a recheck finds the current one exhausted.
pub(crate) struct Slot<F: TransportFactory> {
    id: usize,
    factory: Arc<F>,
    settings: Arc<Settings>,
    current: Mutex<Option<Current<F::Transport>>>,
    recheck: Notify,
    recycles: AtomicU64,
}

impl<F: TransportFactory> Slot<F> {
    /// Open the first handle of a new slot
    pub(crate) fn open(id: usize, factory: Arc<F>, settings: Arc<Settings>) -> Result<Self> {
        let transport = factory.create(&settings.destination)?;
        let current = Current::open(transport, Arc::clone(&settings.header_prefix));
        Ok(Self {
            id,
            factory,
            settings,
            current: Mutex::new(Some(current)),
            recheck: Notify::new(),
            recycles: AtomicU64::new(0),
        })
    }

    pub(crate) const fn id(&self) -> usize {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Option<Current<F::Transport>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the current handle for one request
    fn acquire(&self) -> Result<InFlight<F::Transport>> {
        let current = self.lock();
        let current = current.as_ref().ok_or(ErrorKind::PoolUnavailable)?;
        current.handle.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(InFlight {
            handle: Arc::clone(&current.handle),
            _guard: current.guard.clone(),
        })
    }

    /// Run `request` on the current handle and record what the response
    /// says about that handle
    pub(crate) async fn execute(&self, request: Request) -> Result<Response> {
        let claim = self.acquire()?;
        let handle = Arc::clone(&claim.handle);

        let result = handle.transport.execute(request).await;
        handle.served.fetch_add(1, Ordering::AcqRel);
        if let Ok(response) = &result {
            let headers = response.headers();
            handle.tracker.observe(headers);
            if self.settings.drop_policy.should_drop(headers) {
                handle.drop_requested.store(true, Ordering::Release);
            }
        }

        drop(claim);
        // Stores at most one permit, so bursts collapse into a single check
        self.recheck.notify_one();
        result
    }

    /// Recheck loop, one per slot, until `shutdown` fires or its sender is gone
    pub(crate) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = self.recheck.notified() => {}
                _ = shutdown.changed() => break,
            }
            if self.recycle_due() {
                self.recycle().await;
            }
        }
        trace!("Recheck loop of slot {} stopped", self.id);
    }

    fn recycle_due(&self) -> bool {
        let current = self.lock();
        let Some(current) = current.as_ref() else {
            return false;
        };
        let handle = &current.handle;
        self.settings.recycle_due(
            handle.served.load(Ordering::Acquire),
            handle.tracker.minimum(),
            handle.drop_requested.load(Ordering::Acquire),
        )
    }

    /// Swap in a fresh handle, then drain and close the old one
    async fn recycle(&self) {
        let transport = match self.factory.create(&self.settings.destination) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(
                    "Slot {}: cannot open replacement handle, keeping the current one: {e}",
                    self.id
                );
                return;
            }
        };
        let fresh = Current::open(transport, Arc::clone(&self.settings.header_prefix));

        let retired = {
            let mut current = self.lock();
            match current.as_mut() {
                Some(current) => std::mem::replace(current, fresh),
                None => {
                    // Closed while the replacement was being opened
                    if let Err(e) = fresh.handle.transport.close_idle_connections() {
                        warn!("Slot {}: error closing unused handle: {e}", self.id);
                    }
                    return;
                }
            }
        };

        let handle = Arc::clone(&retired.handle);
        let drain_started = Instant::now();
        drain(retired).await;
        let drain_duration = drain_started.elapsed();
        self.recycles.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = handle.transport.close_idle_connections() {
            warn!("Slot {}: error closing retired handle: {e}", self.id);
        }

        let event = RecycleEvent {
            slot_id: self.id,
            requests_served: handle.served.load(Ordering::Acquire),
            handle_age: handle.opened.elapsed(),
            drain_duration,
        };
        debug!("{event}");
        if let Some(observer) = &self.settings.observer {
            observer(&event);
        }
    }

    /// Take the current handle out of service, wait for its requests, and
    /// close it. Later requests fail with [`ErrorKind::PoolUnavailable`].
    pub(crate) async fn close(&self) -> Result<()> {
        let Some(current) = self.lock().take() else {
            return Ok(());
        };
        let handle = Arc::clone(&current.handle);
        drain(current).await;
        handle.transport.close_idle_connections()
    }

    pub(crate) fn stats(&self) -> SlotStats {
        let mut stats = SlotStats {
            id: self.id,
            recycles: self.recycles.load(Ordering::Acquire),
            ..SlotStats::default()
        };
        if let Some(current) = self.lock().as_ref() {
            stats.served = current.handle.served.load(Ordering::Acquire);
            stats.in_flight = current.handle.in_flight.load(Ordering::Acquire);
            stats.minimum_remaining = current.handle.tracker.minimum();
        }
        stats
    }
}

/// Wait until no request holds the handle any more
async fn drain<T>(retired: Current<T>) {
    let Current { guard, waiter, .. } = retired;
    drop(guard);
    waiter.wait().await;
}
