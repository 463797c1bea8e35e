use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::unmanaged::{Object, Pool};
use log::{debug, trace, warn};
use reqwest::{Request, Response};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;

use super::config::Settings;
use super::event::RecycleEvent;
use super::{Balancer, Cancel};
use crate::ratelimit::RateLimitTracker;
use crate::transport::{Transport, TransportFactory};
use crate::waiter::{WaitGroup, WaitGuard};
use crate::{Destination, ErrorKind, Result};

/// Pause before the producer retries after the factory failed
const CREATE_BACKOFF: Duration = Duration::from_millis(100);

/// A handle waiting in, or borrowed from, the ready queue.
///
/// Holds one capacity token for as long as it exists.
struct Pooled<T> {
    id: usize,
    transport: T,
    tracker: RateLimitTracker,
    served: u64,
    opened: Instant,
    _permit: OwnedSemaphorePermit,
}

/// A bounded queue of ready handles, each used by one request at a time.
///
/// A background producer opens a handle whenever a capacity token is free
/// and puts it into the queue. Requests wait for a ready handle, use it
/// exclusively, and then either return it or, if the drop policy fires on
/// the response, close it. Closing releases the token, so the producer
/// opens a replacement.
///
/// At most `capacity` handles exist at any time, including the ones in use.
pub struct QueuePool<F: TransportFactory> {
    settings: Arc<Settings>,
    tokens: Arc<Semaphore>,
    ready: Pool<Pooled<F::Transport>>,
    shutdown: watch::Sender<bool>,
    producer: Mutex<Option<JoinHandle<()>>>,
    outstanding: Mutex<Option<(WaitGroup, WaitGuard)>>,
}

impl<F: TransportFactory> QueuePool<F> {
    pub(crate) fn new(settings: Settings, capacity: usize, factory: F) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let settings = Arc::new(settings);
        let tokens = Arc::new(Semaphore::new(capacity));
        let ready = Pool::new(capacity);
        let (shutdown, _) = watch::channel(false);

        let producer = Producer {
            factory,
            settings: Arc::clone(&settings),
            tokens: Arc::clone(&tokens),
            ready: ready.clone(),
            next_id: AtomicUsize::new(0),
        };
        let producer = runtime.spawn(producer.run(shutdown.subscribe()));

        debug!(
            "Opened queue pool for {} with capacity {capacity}",
            settings.destination
        );
        Ok(Self {
            settings,
            tokens,
            ready,
            shutdown,
            producer: Mutex::new(Some(producer)),
            outstanding: Mutex::new(Some(WaitGroup::new())),
        })
    }

    /// Destination this pool serves
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.settings.destination
    }

    /// Handles currently sitting idle in the ready queue
    #[must_use]
    pub fn ready_handles(&self) -> usize {
        self.ready.status().available
    }

    /// Handles that exist right now, idle or in use
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.ready.status().max_size - self.tokens.available_permits()
    }

    /// Register a request so that shutdown waits for it
    fn track(&self) -> Option<WaitGuard> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, guard)| guard.clone())
    }

    /// Retire `handle` if its responses say so, otherwise leave it queued
    fn settle(&self, handle: Object<Pooled<F::Transport>>, response: &Response) {
        let headers = response.headers();
        handle.tracker.observe(headers);
        let flagged = self.settings.drop_policy.should_drop(headers);
        if !self
            .settings
            .recycle_due(handle.served, handle.tracker.minimum(), flagged)
        {
            return;
        }

        let handle = Object::take(handle);
        let event = RecycleEvent {
            slot_id: handle.id,
            requests_served: handle.served,
            handle_age: handle.opened.elapsed(),
            drain_duration: Duration::ZERO,
        };
        close(handle);
        debug!("{event}");
        if let Some(observer) = &self.settings.observer {
            observer(&event);
        }
    }
}

/// Close a handle that no request uses; its capacity token is released
/// afterwards
fn close<T: Transport>(handle: Pooled<T>) {
    if let Err(e) = handle.transport.close_idle_connections() {
        warn!("Error closing handle {}: {e}", handle.id);
    }
}

#[async_trait]
impl<F: TransportFactory> Balancer for QueuePool<F> {
    async fn execute_cancellable(&self, request: Request, mut cancel: Cancel) -> Result<Response> {
        self.settings.admit(&request)?;

        let mut handle = tokio::select! {
            handle = self.ready.get() => handle.map_err(|_| ErrorKind::PoolUnavailable)?,
            () = &mut cancel => return Err(ErrorKind::Cancelled),
        };
        let Some(guard) = self.track() else {
            // Shutdown started while this request was waiting
            close(Object::take(handle));
            return Err(ErrorKind::PoolUnavailable);
        };

        trace!("Sending {} via handle {}", request.url(), handle.id);
        let outcome = tokio::select! {
            result = handle.transport.execute(request) => Some(result),
            () = cancel => None,
        };

        // The handle must be back in the queue before shutdown stops waiting
        let result = match outcome {
            Some(Ok(response)) => {
                handle.served += 1;
                self.settle(handle, &response);
                Ok(response)
            }
            Some(Err(e)) => {
                handle.served += 1;
                drop(handle);
                Err(e)
            }
            None => {
                drop(handle);
                Err(ErrorKind::Cancelled)
            }
        };
        drop(guard);
        result
    }

    fn destinations(&self) -> Vec<Destination> {
        vec![self.settings.destination.clone()]
    }

    async fn shutdown(&self) -> Result<()> {
        let Some((waiter, guard)) = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        debug!("Shutting down queue pool for {}", self.settings.destination);

        self.shutdown.send_replace(true);
        self.tokens.close();
        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut errors = Vec::new();
        if let Some(producer) = producer {
            if let Err(e) = producer.await {
                errors.push(ErrorKind::BackgroundTask(e));
            }
        }

        drop(guard);
        waiter.wait().await;

        while let Ok(handle) = self.ready.try_remove() {
            if let Err(e) = handle.transport.close_idle_connections() {
                errors.push(e);
            }
        }
        self.ready.close();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorKind::Shutdown(errors))
        }
    }
}

impl<F: TransportFactory> fmt::Debug for QueuePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePool")
            .field("destination", &self.settings.destination)
            .field("ready", &self.ready_handles())
            .field("live", &self.live_handles())
            .finish_non_exhaustive()
    }
}

/// Background task refilling the ready queue
struct Producer<F: TransportFactory> {
    factory: F,
    settings: Arc<Settings>,
    tokens: Arc<Semaphore>,
    ready: Pool<Pooled<F::Transport>>,
    next_id: AtomicUsize,
}

impl<F: TransportFactory> Producer<F> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.tokens).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.factory.create(&self.settings.destination) {
                Ok(transport) => {
                    let handle = Pooled {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        transport,
                        tracker: RateLimitTracker::new(Arc::clone(&self.settings.header_prefix)),
                        served: 0,
                        opened: Instant::now(),
                        _permit: permit,
                    };
                    trace!("Opened handle {} for {}", handle.id, self.settings.destination);
                    if let Err((handle, _)) = self.ready.try_add(handle) {
                        close(handle);
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        "Cannot open handle for {}, retrying: {e}",
                        self.settings.destination
                    );
                    drop(permit);
                    tokio::select! {
                        () = tokio::time::sleep(CREATE_BACKOFF) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        trace!("Producer for {} stopped", self.settings.destination);
    }
}
