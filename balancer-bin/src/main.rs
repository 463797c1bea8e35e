//! `balancer` sends requests to a rate-limited HTTP upstream through a
//! recycling connection pool and reports how the upstream's quota evolves.
//!
//! The binary is a thin wrapper around balancer-lib.
//!
//! Send 500 requests, 16 at a time, through 8 connection handles:
//!
//! ```sh
//! balancer -n 500 -c 16 --capacity 8 \
//!     -H "Authorization: Bearer $TOKEN" \
//!     "https://management.azure.com/subscriptions?api-version=2022-12-01"
//! ```
//!
//! Settings can also live in `balancer.toml`:
//!
//! ```toml
//! capacity = 8
//! recycle_threshold = 100
//! verbose = "debug"
//!
//! [header]
//! Authorization = "Bearer ..."
//! ```
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

use std::path::PathBuf;

use anyhow::{Result, bail};
use balancer_lib::{Balancer, RateLimitTracker};
use clap::{Parser, crate_version};
use futures::StreamExt;
use log::{error, warn};
use reqwest::{Method, Request, StatusCode, Url};

#[cfg(feature = "native-tls")]
use openssl_sys as _; // required for vendored-openssl feature

mod client;
mod logging;
mod options;
mod verbosity;

use crate::logging::init_logging;
use crate::options::{BALANCER_CONFIG_FILE, BalancerOptions, Config};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator, e.g. a pool that cannot be set up.
    #[allow(unused)]
    UnexpectedFailure = 1,
    RequestFailure = 2,
    ConfigFile = 3,
}

fn main() -> Result<()> {
    // std::process::exit doesn't run destructors, so all work happens in
    // `run_main` and its values are dropped before exiting.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Merge all provided config options into one.
/// This includes a potential config file and command-line flags.
fn load_config() -> Result<BalancerOptions> {
    let mut opts = BalancerOptions::parse();

    // Fall back to `./balancer.toml` if no file was given. It is not an error
    // for it to be missing, but it is for it to be invalid.
    let config_file = opts.config_file.clone().or_else(|| {
        let default_config = PathBuf::from(BALANCER_CONFIG_FILE);
        default_config.is_file().then_some(default_config)
    });

    if let Some(config_file) = config_file {
        match Config::load_from_file(&config_file) {
            Ok(c) => opts.config.merge(c),
            Err(e) => {
                init_logging(&opts.config.verbose);
                bail!(
                    "Cannot load configuration file `{}`: {e:?}",
                    config_file.display()
                );
            }
        }
    }

    init_logging(&opts.config.verbose);
    Ok(opts)
}

/// Set up runtime and call the balancer entrypoint
fn run_main() -> Result<i32> {
    use std::process::exit;

    let opts = match load_config() {
        Ok(opts) => opts,
        Err(e) => {
            error!(
                "Error while loading config: {e}\n\
                See `balancer --help` (version {}) for the available settings",
                crate_version!()
            );
            exit(ExitCode::ConfigFile as i32);
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let exit_code = runtime.block_on(run(&opts))?;
    Ok(exit_code as i32)
}

/// Send one request and return its status with the lowest reported quota
async fn send(
    balancer: &dyn Balancer,
    url: &Url,
    prefix: &str,
) -> Result<(StatusCode, Option<u64>)> {
    let response = balancer
        .execute(Request::new(Method::GET, url.clone()))
        .await?;
    let status = response.status();
    let tracker = RateLimitTracker::new(prefix);
    tracker.observe(response.headers());

    // Read the body so the connection can be reused
    response.bytes().await?;
    Ok((status, tracker.minimum()))
}

/// Send all requests and print one line per response
async fn run(opts: &BalancerOptions) -> Result<ExitCode> {
    let pool = client::create(opts)?;
    let balancer = pool.balancer();
    let prefix = opts.config.header_prefix.as_str();

    if opts.config.concurrency == 0 {
        warn!("A concurrency of 0 would never send anything, using 1");
    }

    let mut responses = futures::stream::iter(0..opts.config.requests)
        .map(|index| async move { (index, send(balancer, &opts.url, prefix).await) })
        .buffer_unordered(opts.config.concurrency.max(1));

    let mut failures = 0;
    while let Some((index, result)) = responses.next().await {
        match result {
            Ok((status, remaining)) => {
                let remaining =
                    remaining.map_or_else(|| "n/a".to_string(), |value| value.to_string());
                println!("#{index} {status} remaining {remaining}");
                if !status.is_success() {
                    failures += 1;
                }
            }
            Err(e) => {
                println!("#{index} failed: {e}");
                failures += 1;
            }
        }
    }

    println!("{}", pool.summary());
    balancer.shutdown().await?;

    if failures > 0 {
        warn!("{failures} of {} requests failed", opts.config.requests);
        Ok(ExitCode::RequestFailure)
    } else {
        Ok(ExitCode::Success)
    }
}
