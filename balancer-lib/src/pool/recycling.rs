use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Request, Response};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::Settings;
use super::slot::Slot;
use super::stats::PoolStats;
use super::{Balancer, Cancel};
use crate::transport::TransportFactory;
use crate::{Destination, ErrorKind, Result};

/// A fixed set of slots, chosen round-robin, that recycle their handles in
/// place.
///
/// Each slot runs its own background task that retires a handle once the
/// upstream reports its quota below the recycle threshold, after the handle
/// has served a minimum number of requests. Requests already running on the
/// retired handle finish on it; new requests go to the replacement.
///
/// Exactly `capacity` handles accept new requests at any time. A retired
/// handle stays open only until its last request completes.
pub struct RecyclingPool<F: TransportFactory> {
    settings: Arc<Settings>,
    slots: Vec<Arc<Slot<F>>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: TransportFactory> RecyclingPool<F> {
    pub(crate) fn new(settings: Settings, capacity: usize, factory: F) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let settings = Arc::new(settings);
        let factory = Arc::new(factory);

        let slots = (0..capacity)
            .map(|id| Slot::open(id, Arc::clone(&factory), Arc::clone(&settings)).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let (shutdown, _) = watch::channel(false);
        let tasks = slots
            .iter()
            .map(|slot| runtime.spawn(Arc::clone(slot).run(shutdown.subscribe())))
            .collect();

        debug!(
            "Opened recycling pool for {} with {capacity} slots",
            settings.destination
        );
        Ok(Self {
            settings,
            slots,
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Destination this pool serves
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.settings.destination
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current state of every slot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            destination: self.settings.destination.clone(),
            slots: self.slots.iter().map(|slot| slot.stats()).collect(),
        }
    }

    fn next_slot(&self) -> &Slot<F> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        &self.slots[index]
    }
}

#[async_trait]
impl<F: TransportFactory> Balancer for RecyclingPool<F> {
    async fn execute_cancellable(&self, request: Request, cancel: Cancel) -> Result<Response> {
        self.settings.admit(&request)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ErrorKind::PoolUnavailable);
        }

        let slot = self.next_slot();
        trace!("Sending {} via slot {}", request.url(), slot.id());
        tokio::select! {
            result = slot.execute(request) => result,
            () = cancel => Err(ErrorKind::Cancelled),
        }
    }

    fn destinations(&self) -> Vec<Destination> {
        vec![self.settings.destination.clone()]
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Shutting down pool for {}", self.settings.destination);
        self.shutdown.send_replace(true);

        let mut errors = Vec::new();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                errors.push(ErrorKind::BackgroundTask(e));
            }
        }
        for slot in &self.slots {
            if let Err(e) = slot.close().await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorKind::Shutdown(errors))
        }
    }
}

impl<F: TransportFactory> fmt::Debug for RecyclingPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecyclingPool")
            .field("destination", &self.settings.destination)
            .field("capacity", &self.slots.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolBuilder, PoolConfig, RecycleEvent};
    use crate::test_utils::{MOCK_HANDLE_HEADER, MockFactory, get};
    use futures::FutureExt;
    use http::HeaderMap;
    use http::header::RETRY_AFTER;
    use std::collections::HashSet;
    use std::time::Duration;

    fn config(capacity: usize, threshold: u64, min_requests: u64) -> PoolConfig {
        PoolConfig {
            capacity,
            recycle_threshold: threshold,
            min_requests_before_recycle: min_requests,
            ..PoolConfig::for_destination("host.example:443").unwrap()
        }
    }

    fn pool(factory: &MockFactory, config: PoolConfig) -> Arc<RecyclingPool<MockFactory>> {
        Arc::new(
            PoolBuilder::builder()
                .config(config)
                .build()
                .recycling_pool(factory.clone())
                .unwrap(),
        )
    }

    #[test]
    fn test_requires_runtime() {
        let error = PoolBuilder::builder()
            .build()
            .recycling_pool(MockFactory::with_budget(10))
            .unwrap_err();
        assert!(matches!(error, ErrorKind::Runtime(_)));
    }

    #[tokio::test]
    async fn test_opens_all_slots_up_front() {
        let factory = MockFactory::with_budget(100);
        let pool = pool(&factory, config(4, 5, 6));
        assert_eq!(factory.opened(), 4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.destinations(), vec![pool.destination().clone()]);
    }

    #[tokio::test]
    async fn test_round_robin() {
        let factory = MockFactory::with_budget(1000);
        let pool = pool(&factory, config(3, 5, 6));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let response = pool.execute(get("https://host.example/")).await.unwrap();
            handles.push(response.headers()[MOCK_HANDLE_HEADER].to_str().unwrap().to_string());
        }
        assert_eq!(handles[..3], handles[3..]);
        assert_eq!(handles.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_other_destination_without_touching_handles() {
        let factory = MockFactory::with_budget(100);
        let pool = pool(&factory, config(2, 5, 6));

        let error = pool
            .execute(get("https://other.example/"))
            .await
            .unwrap_err();
        assert!(error.is_routing());
        assert!(error.to_string().contains("host.example:443"));
        assert!(pool.stats().slots.iter().all(|slot| slot.served == 0));

        let error = pool
            .execute(get("https://host.example:8443/"))
            .await
            .unwrap_err();
        assert!(error.is_routing());
    }

    #[tokio::test]
    async fn test_threshold_triggers_recycle() {
        let factory = MockFactory::with_budget(20);
        let pool = pool(&factory, config(1, 5, 6));

        // remaining drops below 5 on the 16th request
        for _ in 0..20 {
            pool.execute(get("https://host.example/")).await.unwrap();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.stats().total_recycles() >= 1);
        assert!(factory.opened() >= 2);
        assert_eq!(factory.used_after_close(), 0);
    }

    #[tokio::test]
    async fn test_recycles_reqwest_clients() {
        let server = test_utils::countdown_server!(
            "x-ms-ratelimit-remaining-subscription-reads",
            100
        );
        let url: reqwest::Url = server.uri().parse().unwrap();
        let destination = format!("{}:{}", url.host_str().unwrap(), url.port().unwrap());

        let pool = PoolBuilder::builder()
            .config(PoolConfig {
                capacity: 1,
                recycle_threshold: 95,
                min_requests_before_recycle: 1,
                ..PoolConfig::for_destination(&destination).unwrap()
            })
            .build()
            .recycling_pool(crate::ReqwestFactory::default())
            .unwrap();

        for _ in 0..8 {
            let request = Request::new(reqwest::Method::GET, url.clone());
            let response = pool.execute(request).await.unwrap();
            response.bytes().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pool.stats().total_recycles() >= 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_churn_guard() {
        // Every handle reports an exhausted quota right away
        let factory = MockFactory::with_budget(0);
        let pool = pool(&factory, config(2, 5, 6));

        for _ in 0..10 {
            pool.execute(get("https://host.example/")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total_recycles(), 0);
        assert_eq!(factory.opened(), 2);

        for _ in 0..2 {
            pool.execute(get("https://host.example/")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total_recycles(), 2);
        assert!(
            factory
                .served_per_closed_handle()
                .iter()
                .all(|served| *served >= 6)
        );
    }

    fn on_retry_after(headers: &HeaderMap) -> bool {
        headers.contains_key(RETRY_AFTER)
    }

    #[tokio::test]
    async fn test_custom_drop_policy_triggers_recycle() {
        // Plenty of quota, so only the policy can ask for a new handle
        let factory = MockFactory::with_budget(1000).with_retry_after_from(3);
        let pool = PoolBuilder::builder()
            .config(config(1, 5, 1))
            .drop_policy(Arc::new(on_retry_after))
            .build()
            .recycling_pool(factory.clone())
            .unwrap();

        for _ in 0..2 {
            pool.execute(get("https://host.example/")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total_recycles(), 0);

        pool.execute(get("https://host.example/")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total_recycles(), 1);
        assert_eq!(factory.served_per_closed_handle(), vec![3]);
    }

    #[tokio::test]
    async fn test_custom_drop_policy_replaces_threshold() {
        // Every response reports an exhausted quota
        let factory = MockFactory::with_budget(0);
        let pool = PoolBuilder::builder()
            .config(config(1, 5, 1))
            .drop_policy(Arc::new(|_: &HeaderMap| false))
            .build()
            .recycling_pool(factory.clone())
            .unwrap();

        for _ in 0..5 {
            pool.execute(get("https://host.example/")).await.unwrap();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total_recycles(), 0);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_custom_accept_policy() {
        let factory = MockFactory::with_budget(100);
        let pool = PoolBuilder::builder()
            .config(config(1, 5, 6))
            .accept_policy(Arc::new(|request: &Request| {
                request.url().path().starts_with("/api/")
            }))
            .build()
            .recycling_pool(factory.clone())
            .unwrap();

        // The custom policy replaces the destination check entirely
        pool.execute(get("https://mirror.example/api/items")).await.unwrap();

        let error = pool
            .execute(get("https://host.example/static/logo.png"))
            .await
            .unwrap_err();
        assert!(error.is_routing());
        assert!(error.to_string().contains("host.example:443"));
        assert_eq!(pool.stats().slots[0].served, 1);
    }

    #[tokio::test]
    async fn test_observer_receives_events() {
        let events = Arc::new(std::sync::Mutex::new(Vec::<RecycleEvent>::new()));
        let factory = MockFactory::with_budget(10);
        let pool = PoolBuilder::builder()
            .config(config(1, 8, 2))
            .observer(Arc::new({
                let events = Arc::clone(&events);
                move |event: &RecycleEvent| events.lock().unwrap().push(*event)
            }))
            .build()
            .recycling_pool(factory.clone())
            .unwrap();

        for _ in 0..3 {
            pool.execute(get("https://host.example/")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot_id, 0);
        assert_eq!(events[0].requests_served, 3);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_request() {
        let factory = MockFactory::with_budget(100).with_latency(Duration::from_secs(10));
        let pool = pool(&factory, config(1, 5, 6));

        let cancel = tokio::time::sleep(Duration::from_millis(20)).boxed();
        let error = pool
            .execute_cancellable(get("https://host.example/"), cancel)
            .await
            .unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(pool.stats().total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_and_closes_all() {
        let factory = MockFactory::with_budget(100).with_latency(Duration::from_millis(100));
        let pool = pool(&factory, config(2, 5, 6));

        let running = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.execute(get("https://host.example/")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown().await.unwrap();
        assert!(running.await.unwrap().is_ok());
        assert_eq!(factory.closed(), 2);
        assert_eq!(factory.live(), 0);
        assert_eq!(factory.used_after_close(), 0);

        let error = pool
            .execute(get("https://host.example/"))
            .await
            .unwrap_err();
        assert!(error.is_unavailable());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_soak() {
        let factory = MockFactory::with_budget(20).with_latency(Duration::from_millis(1));
        let pool = pool(&factory, config(8, 5, 6));

        let workers: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        pool.execute(get("https://host.example/")).await.unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }
        pool.shutdown().await.unwrap();

        let opened = factory.opened();
        let served = factory.served_per_closed_handle();
        assert!(opened > 8, "no recycling happened, {opened} handles opened");
        assert!(served.len() * 4 >= opened, "too few handles closed");
        assert_eq!(factory.used_after_close(), 0);

        // The last eight entries are the handles closed by the shutdown
        let recycled = &served[..served.len().saturating_sub(8)];
        let outliers = recycled
            .iter()
            .filter(|served| **served > 20 || **served < 6)
            .count();
        assert!(
            outliers * 10 <= recycled.len().max(10),
            "{outliers} of {} handles outside the 6..=20 request window",
            recycled.len()
        );
    }
}
