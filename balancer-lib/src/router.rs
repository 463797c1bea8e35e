//! Route requests to one of several single-destination pools.
//!
//! Pools are keyed by their [`Destination`]. A request goes to the pool
//! configured for its exact `host:port`, where the port defaults to the
//! scheme's well-known one. Failing that, a pool configured for the bare
//! host serves every port of that host.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use reqwest::{Request, Response, Url};

use crate::pool::{Balancer, Cancel};
use crate::{DEFAULT_PORT, Destination, ErrorKind, Result};

/// A [`Balancer`] shared between a router and its creator
pub type SharedBalancer = Arc<dyn Balancer>;

/// Dispatches each request to the pool serving its `host:port`.
///
/// ```no_run
/// # use balancer_lib::{Balancer, PoolBuilder, PoolConfig, ReqwestFactory, Router};
/// # #[tokio::main]
/// # async fn main() -> balancer_lib::Result<()> {
/// let pool = |destination: &str| -> balancer_lib::Result<_> {
///     PoolBuilder::builder()
///         .config(PoolConfig::for_destination(destination)?)
///         .build()
///         .recycling_pool(ReqwestFactory::default())
/// };
/// let router = Router::builder()
///     .pool(pool("management.azure.com")?)
///     .pool(pool("graph.microsoft.com")?)
///     .build()?;
///
/// let request = reqwest::Request::new(
///     reqwest::Method::GET,
///     "https://graph.microsoft.com/v1.0/me".parse().unwrap(),
/// );
/// let response = router.execute(request).await?;
/// # Ok(())
/// # }
/// ```
pub struct Router {
    pools: HashMap<Destination, SharedBalancer>,
}

impl Router {
    /// Start assembling a router
    #[must_use]
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Find the pool responsible for `url`
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidUrlHost`] if the URL has no host
    /// - [`ErrorKind::UnsupportedDestination`] if no pool serves it
    pub fn pool_for(&self, url: &Url) -> Result<&SharedBalancer> {
        let requested = Destination::from_url(url)?;
        let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);
        let exact = Destination::new(requested.host(), Some(port));
        let any_port = Destination::new(requested.host(), None);

        self.pools
            .get(&exact)
            .or_else(|| self.pools.get(&any_port))
            .ok_or_else(|| ErrorKind::UnsupportedDestination {
                requested: exact.to_string(),
                supported: self.supported(),
            })
    }

    /// Configured destinations of all pools, sorted
    fn supported(&self) -> Vec<String> {
        let mut destinations: Vec<_> = self.pools.keys().map(ToString::to_string).collect();
        destinations.sort();
        destinations
    }
}

#[async_trait]
impl Balancer for Router {
    async fn execute_cancellable(&self, request: Request, cancel: Cancel) -> Result<Response> {
        let pool = self.pool_for(request.url())?;
        pool.execute_cancellable(request, cancel).await
    }

    fn destinations(&self) -> Vec<Destination> {
        let mut destinations: Vec<_> = self
            .pools
            .values()
            .flat_map(|pool| pool.destinations())
            .collect();
        destinations.sort_by_key(ToString::to_string);
        destinations.dedup();
        destinations
    }

    async fn shutdown(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (destination, pool) in &self.pools {
            debug!("Shutting down pool for {destination}");
            match pool.shutdown().await {
                Ok(()) => {}
                Err(ErrorKind::Shutdown(failed)) => errors.extend(failed),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorKind::Shutdown(errors))
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("destinations", &self.supported())
            .finish()
    }
}

/// Collects pools for a [`Router`]
#[derive(Default)]
pub struct RouterBuilder {
    pools: Vec<SharedBalancer>,
}

impl RouterBuilder {
    /// Add a pool
    #[must_use]
    pub fn pool(self, pool: impl Balancer + 'static) -> Self {
        self.shared_pool(Arc::new(pool))
    }

    /// Add a pool that is also used elsewhere
    #[must_use]
    pub fn shared_pool(mut self, pool: SharedBalancer) -> Self {
        self.pools.push(pool);
        self
    }

    /// Index all pools by their destinations
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::DuplicateDestination`] if two pools are
    /// configured for the same destination.
    pub fn build(self) -> Result<Router> {
        let mut pools = HashMap::new();
        for pool in self.pools {
            for destination in pool.destinations() {
                if pools.contains_key(&destination) {
                    return Err(ErrorKind::DuplicateDestination(destination.to_string()));
                }
                pools.insert(destination, Arc::clone(&pool));
            }
        }
        Ok(Router { pools })
    }
}

impl fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterBuilder")
            .field("pools", &self.pools.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MOCK_QUOTA_HEADER, MockFactory, get};
    use crate::transport::ReqwestFactory;
    use crate::{PoolBuilder, PoolConfig};
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use test_utils::mock_server;

    fn pool(factory: &MockFactory, destination: &str) -> impl Balancer + 'static {
        PoolBuilder::builder()
            .config(PoolConfig {
                capacity: 2,
                ..PoolConfig::for_destination(destination).unwrap()
            })
            .build()
            .recycling_pool(factory.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_host_and_port() {
        // The budgets tell apart which pool served a response
        let router = Router::builder()
            .pool(pool(&MockFactory::with_budget(100), "a.example"))
            .pool(pool(&MockFactory::with_budget(50), "b.example:8443"))
            .build()
            .unwrap();

        let remaining = |response: Response| {
            response.headers()[MOCK_QUOTA_HEADER]
                .to_str()
                .unwrap()
                .to_string()
        };
        let response = router.execute(get("https://A.example/")).await.unwrap();
        assert_eq!(remaining(response), "99");
        let response = router.execute(get("https://b.example:8443/x")).await.unwrap();
        assert_eq!(remaining(response), "49");

        assert_eq!(
            router
                .destinations()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["a.example", "b.example:8443"]
        );
    }

    #[tokio::test]
    async fn test_rejects_unknown_destination() {
        let factory = MockFactory::with_budget(100);
        let router = Router::builder()
            .pool(pool(&factory, "b.example"))
            .pool(pool(&factory, "a.example:443"))
            .build()
            .unwrap();

        let error = router
            .execute(get("https://other.example/"))
            .await
            .unwrap_err();
        assert_eq!(
            error,
            ErrorKind::UnsupportedDestination {
                requested: "other.example:443".into(),
                supported: vec!["a.example:443".into(), "b.example".into()],
            }
        );

        // Same host, different port
        let error = router
            .execute(get("http://a.example/"))
            .await
            .unwrap_err();
        assert!(error.is_routing());
    }

    #[tokio::test]
    async fn test_url_without_host() {
        let factory = MockFactory::with_budget(100);
        let router = Router::builder()
            .pool(pool(&factory, "a.example"))
            .build()
            .unwrap();
        let error = router
            .execute(get("data:text/plain,hello"))
            .await
            .unwrap_err();
        assert_eq!(error, ErrorKind::InvalidUrlHost);
    }

    #[tokio::test]
    async fn test_portless_pool_serves_every_port() {
        let router = Router::builder()
            .pool(pool(&MockFactory::with_budget(100), "a.example"))
            .build()
            .unwrap();

        for url in ["http://a.example/", "https://a.example/", "https://a.example:8443/"] {
            let response = router.execute(get(url)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{url}");
        }
    }

    #[tokio::test]
    async fn test_exact_port_wins_over_portless_pool() {
        let router = Router::builder()
            .pool(pool(&MockFactory::with_budget(100), "a.example"))
            .pool(pool(&MockFactory::with_budget(50), "a.example:8443"))
            .build()
            .unwrap();

        let remaining = |response: Response| response.headers()[MOCK_QUOTA_HEADER].clone();
        let response = router.execute(get("https://a.example:8443/")).await.unwrap();
        assert_eq!(remaining(response), "49");
        let response = router.execute(get("https://a.example/")).await.unwrap();
        assert_eq!(remaining(response), "99");
    }

    #[tokio::test]
    async fn test_duplicate_destination() {
        let factory = MockFactory::with_budget(100);
        let error = Router::builder()
            .pool(pool(&factory, "a.example:443"))
            .pool(pool(&factory, "A.example:443"))
            .build()
            .unwrap_err();
        assert_eq!(
            error,
            ErrorKind::DuplicateDestination("a.example:443".into())
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_pool() {
        let first = MockFactory::with_budget(100);
        let second = MockFactory::with_budget(100);
        let router = Router::builder()
            .pool(pool(&first, "a.example"))
            .pool(pool(&second, "b.example"))
            .build()
            .unwrap();

        router.shutdown().await.unwrap();
        assert_eq!(first.live(), 0);
        assert_eq!(second.live(), 0);
        let error = router.execute(get("https://a.example/")).await.unwrap_err();
        assert!(error.is_unavailable());
    }

    #[tokio::test]
    async fn test_end_to_end_with_reqwest() {
        let server = mock_server!(
            StatusCode::OK,
            insert_header("x-ms-ratelimit-remaining-subscription-reads", "42")
        );
        let url: Url = server.uri().parse().unwrap();
        let destination = format!("{}:{}", url.host_str().unwrap(), url.port().unwrap());

        let pool = Arc::new(
            PoolBuilder::builder()
                .config(PoolConfig {
                    capacity: 2,
                    ..PoolConfig::for_destination(&destination).unwrap()
                })
                .build()
                .recycling_pool(ReqwestFactory::default())
                .unwrap(),
        );
        let router = Router::builder()
            .shared_pool(Arc::clone(&pool) as SharedBalancer)
            .build()
            .unwrap();

        let response = router
            .execute(Request::new(reqwest::Method::GET, url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            pool.stats().slots[0].minimum_remaining,
            Some(42)
        );

        router.shutdown().await.unwrap();
    }
}
