use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Error, Result, anyhow};
use balancer_lib::pool::{
    DEFAULT_CAPACITY, DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE, DEFAULT_RECYCLE_THRESHOLD,
};
use balancer_lib::ratelimit::DEFAULT_HEADER_PREFIX;
use balancer_lib::transport::{DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use balancer_lib::{Destination, PoolConfig};
use clap::Parser;
use clap::builder::TypedValueParser;
use const_format::{concatcp, formatcp};
use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Deserializer};

use crate::verbosity::Verbosity;

pub(crate) const BALANCER_CONFIG_FILE: &str = "balancer.toml";

pub(crate) const DEFAULT_REQUESTS: usize = 1;
pub(crate) const DEFAULT_CONCURRENCY: usize = 4;

const REQUESTS_STR: &str = concatcp!(DEFAULT_REQUESTS);
const CONCURRENCY_STR: &str = concatcp!(DEFAULT_CONCURRENCY);
const CAPACITY_STR: &str = concatcp!(DEFAULT_CAPACITY);
const THRESHOLD_STR: &str = concatcp!(DEFAULT_RECYCLE_THRESHOLD);
const MIN_REQUESTS_STR: &str = concatcp!(DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE);
const TIMEOUT_STR: &str = concatcp!(DEFAULT_TIMEOUT_SECS);

const HELP_MSG_CONFIG_FILE: &str = formatcp!(
    "Configuration file to use

By default, `./{BALANCER_CONFIG_FILE}` is loaded if it exists. Values given
on the command line take precedence over the file.",
);

// Generate functions used as serde defaults
macro_rules! default_function {
    ( $( $name:ident : $T:ty = $e:expr; )* ) => {
        $(
            #[allow(clippy::missing_const_for_fn)]
            fn $name() -> $T {
                $e
            }
        )*
    };
}

default_function! {
    requests: usize = DEFAULT_REQUESTS;
    concurrency: usize = DEFAULT_CONCURRENCY;
    capacity: usize = DEFAULT_CAPACITY;
    recycle_threshold: u64 = DEFAULT_RECYCLE_THRESHOLD;
    min_requests_before_recycle: u64 = DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE;
    header_prefix: String = DEFAULT_HEADER_PREFIX.to_string();
    timeout: u64 = DEFAULT_TIMEOUT_SECS;
    user_agent: String = DEFAULT_USER_AGENT.to_string();
    verbosity: Verbosity = Verbosity::default();
}

// Take a value from the config file wherever the command line kept the default
macro_rules! fold_in {
    ($cli:ident , $toml:ident ; $ty:ident { $(..$ignore:ident,)* $( $key:ident : $default:expr, )* } ) => {
        if (false) {
            #[allow(dead_code, unused, clippy::diverging_sub_expression)]
            let _check_fold_in_exhaustivity = $ty {
                $($key: unreachable!(), )*
                $($ignore: unreachable!(), )*
            };
        };
        $(
            if $cli.$key == $default && $toml.$key != $default {
                $cli.$key = $toml.$key;
            }
        )*
    };
}

/// Split `Header-Name: value` at the first colon.
///
/// Values are never echoed in errors since they often carry credentials.
fn parse_single_header(header: &str) -> Result<(HeaderName, HeaderValue)> {
    let Some((name, value)) = header.split_once(':') else {
        return Err(anyhow!(
            "Invalid header format. Expected colon-separated string in the format 'HeaderName: HeaderValue'"
        ));
    };
    let name = name.trim();
    let name = HeaderName::from_str(name)
        .map_err(|e| anyhow!("Unable to convert header name '{name}': {e}"))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|e| anyhow!("Unable to read value of header with name '{name}': {e}"))?;
    Ok((name, value))
}

#[derive(Clone, Debug)]
struct HeaderParser;

impl TypedValueParser for HeaderParser {
    type Value = (String, String);

    fn parse_ref(
        &self,
        _cmd: &clap::Command,
        _arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> Result<Self::Value, clap::Error> {
        let invalid = |message: String| clap::Error::raw(clap::error::ErrorKind::InvalidValue, message);

        let header = value
            .to_str()
            .ok_or_else(|| invalid("Header value contains invalid UTF-8".into()))?;
        let (name, value) = parse_single_header(header).map_err(|e| invalid(e.to_string()))?;
        let value = value
            .to_str()
            .map_err(|_| invalid("Header value contains invalid UTF-8".into()))?;
        Ok((name.to_string(), value.to_string()))
    }
}

impl clap::builder::ValueParserFactory for HeaderParser {
    type Parser = HeaderParser;
    fn value_parser() -> Self::Parser {
        HeaderParser
    }
}

/// Convert collected header pairs into a `HeaderMap`
pub(crate) trait HeaderMapExt {
    fn from_header_pairs(headers: &[(String, String)]) -> Result<HeaderMap, Error>;
}

impl HeaderMapExt for HeaderMap {
    fn from_header_pairs(headers: &[(String, String)]) -> Result<HeaderMap, Error> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow!("Invalid header name '{name}': {e}"))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| anyhow!("Invalid header value for '{name}': {e}"))?;
            header_map.insert(header_name, header_value);
        }
        Ok(header_map)
    }
}

/// balancer sends requests to a rate-limited upstream through a pool of
/// connection handles and recycles a handle before the upstream instance
/// behind it starts throttling.
///
/// Each response is printed with its status and the lowest remaining quota
/// the upstream reported. Per-handle statistics follow at the end.
#[derive(Parser, Debug)]
#[command(version, about, next_display_order = None)]
pub(crate) struct BalancerOptions {
    /// URL to request; its `host:port` becomes the pool destination
    pub(crate) url: Url,

    #[arg(long = "config", help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) config: Config,
}

impl BalancerOptions {
    /// Pool settings for the destination of [`BalancerOptions::url`]
    pub(crate) fn pool_config(&self) -> Result<PoolConfig> {
        let destination = Destination::from_url(&self.url)
            .with_context(|| format!("Cannot send requests to `{}`", self.url))?;
        let config = PoolConfig {
            destination,
            capacity: self.config.capacity,
            recycle_threshold: self.config.recycle_threshold,
            min_requests_before_recycle: self.config.min_requests_before_recycle,
            header_prefix: self.config.header_prefix.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

fn deserialize_headers<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(map
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect())
}

/// Settings which can be given on the command line or in `balancer.toml`
#[allow(clippy::struct_excessive_bools)]
#[derive(Parser, Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Number of requests to send
    #[arg(short = 'n', long, default_value = REQUESTS_STR)]
    #[serde(default = "requests")]
    pub(crate) requests: usize,

    /// Number of requests running at the same time
    #[arg(short = 'c', long, default_value = CONCURRENCY_STR)]
    #[serde(default = "concurrency")]
    pub(crate) concurrency: usize,

    /// Number of connection handles in the pool
    #[arg(long, default_value = CAPACITY_STR)]
    #[serde(default = "capacity")]
    pub(crate) capacity: usize,

    /// Recycle a handle once its lowest remaining quota drops below this
    #[arg(long = "threshold", default_value = THRESHOLD_STR)]
    #[serde(default = "recycle_threshold")]
    pub(crate) recycle_threshold: u64,

    /// Never recycle a handle that served fewer requests
    #[arg(long = "min-requests", default_value = MIN_REQUESTS_STR)]
    #[serde(default = "min_requests_before_recycle")]
    pub(crate) min_requests_before_recycle: u64,

    /// Prefix of the response headers reporting remaining quota
    #[arg(long, default_value = DEFAULT_HEADER_PREFIX)]
    #[serde(default = "header_prefix")]
    pub(crate) header_prefix: String,

    /// Hand out whole handles from a queue and replace them when exhausted,
    /// instead of recycling slots in place
    #[arg(long)]
    #[serde(default)]
    pub(crate) queue: bool,

    /// Custom request header, e.g. `-H 'Authorization: Bearer ...'`
    #[arg(
        short = 'H',
        long = "header",
        value_parser = HeaderParser,
        number_of_values = 1
    )]
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub(crate) header: Vec<(String, String)>,

    /// Timeout per request in seconds, 0 disables it
    #[arg(short, long, default_value = TIMEOUT_STR)]
    #[serde(default = "timeout")]
    pub(crate) timeout: u64,

    /// User agent
    #[arg(short, long, default_value = DEFAULT_USER_AGENT)]
    #[serde(default = "user_agent")]
    pub(crate) user_agent: String,

    /// Accept invalid TLS certificates
    #[arg(short = 'k', long)]
    #[serde(default)]
    pub(crate) insecure: bool,

    /// Speak HTTP/2 without negotiating it first
    #[arg(long)]
    #[serde(default)]
    pub(crate) http2_prior_knowledge: bool,

    #[clap(flatten)]
    #[serde(default = "verbosity")]
    pub(crate) verbose: Verbosity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            requests: DEFAULT_REQUESTS,
            concurrency: DEFAULT_CONCURRENCY,
            capacity: DEFAULT_CAPACITY,
            recycle_threshold: DEFAULT_RECYCLE_THRESHOLD,
            min_requests_before_recycle: DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE,
            header_prefix: header_prefix(),
            queue: false,
            header: Vec::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            user_agent: user_agent(),
            insecure: false,
            http2_prior_knowledge: false,
            verbose: Verbosity::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }

    /// Merge values from the config file into the command-line options.
    ///
    /// Headers from both sources are combined. The file wins for a header
    /// set in both places.
    pub(crate) fn merge(&mut self, toml: Config) {
        let mut headers: HashMap<_, _> = self.header.drain(..).collect();
        headers.extend(toml.header);
        self.header = headers.into_iter().collect();

        fold_in! {
            self, toml;

            Config {
                ..header,

                requests: DEFAULT_REQUESTS,
                concurrency: DEFAULT_CONCURRENCY,
                capacity: DEFAULT_CAPACITY,
                recycle_threshold: DEFAULT_RECYCLE_THRESHOLD,
                min_requests_before_recycle: DEFAULT_MIN_REQUESTS_BEFORE_RECYCLE,
                header_prefix: DEFAULT_HEADER_PREFIX,
                queue: false,
                timeout: DEFAULT_TIMEOUT_SECS,
                user_agent: DEFAULT_USER_AGENT,
                insecure: false,
                http2_prior_knowledge: false,
                verbose: Verbosity::default(),
            }
        }
    }

    /// Request timeout, `None` if disabled
    pub(crate) const fn timeout(&self) -> Option<Duration> {
        match self.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
