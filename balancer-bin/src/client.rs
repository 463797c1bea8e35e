use std::sync::Arc;

use anyhow::{Context, Result};
use balancer_lib::{
    Balancer, PoolBuilder, QueuePool, RecycleEvent, RecyclingPool, ReqwestFactory,
};
use http::HeaderMap;
use log::info;

use crate::options::{BalancerOptions, HeaderMapExt};

/// The pool realization picked on the command line
pub(crate) enum Pool {
    Recycling(RecyclingPool<ReqwestFactory>),
    Queue(QueuePool<ReqwestFactory>),
}

impl Pool {
    pub(crate) fn balancer(&self) -> &dyn Balancer {
        match self {
            Pool::Recycling(pool) => pool,
            Pool::Queue(pool) => pool,
        }
    }

    /// Statistics printed once all requests are done
    pub(crate) fn summary(&self) -> String {
        match self {
            Pool::Recycling(pool) => {
                let stats = pool.stats();
                format!(
                    "{}\n{} recycles in total",
                    stats.summary(),
                    stats.total_recycles()
                )
            }
            Pool::Queue(pool) => format!(
                "{}: {} live handles, {} ready",
                pool.destination(),
                pool.live_handles(),
                pool.ready_handles()
            ),
        }
    }
}

/// Creates a pool according to the command-line options.
///
/// Must be called from within the Tokio runtime.
pub(crate) fn create(opts: &BalancerOptions) -> Result<Pool> {
    let cfg = &opts.config;
    let headers = HeaderMap::from_header_pairs(&cfg.header)?;
    // The queue producer would otherwise retry an unusable factory forever
    http::HeaderValue::from_str(&cfg.user_agent).context("Invalid User-Agent header")?;

    let factory = ReqwestFactory::builder()
        .user_agent(cfg.user_agent.clone())
        .headers(headers)
        .timeout(cfg.timeout())
        .http2_prior_knowledge(cfg.http2_prior_knowledge)
        .allow_insecure(cfg.insecure)
        .build();

    let builder = PoolBuilder::builder()
        .config(opts.pool_config()?)
        .observer(Arc::new(|event: &RecycleEvent| info!("{event}")))
        .build();

    let pool = if cfg.queue {
        Pool::Queue(builder.queue_pool(factory)?)
    } else {
        Pool::Recycling(builder.recycling_pool(factory)?)
    };
    Ok(pool)
}
