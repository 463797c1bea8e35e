use http::uri::Authority;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

use crate::ErrorKind;
use crate::types::Result;

/// Port the router assumes for a request URL whose scheme has no
/// well-known port.
pub const DEFAULT_PORT: u16 = 443;

/// A normalized `host[:port]` pair which a pool is bound to.
///
/// Hosts are lower-cased so that lookups are case-insensitive.
/// The port is optional; see [`Destination::matches`] for what an absent
/// port means when comparing against a request.
///
/// # Examples
///
/// ```
/// use balancer_lib::Destination;
///
/// let destination: Destination = "Management.Azure.com:443".parse().unwrap();
/// assert_eq!(destination.host(), "management.azure.com");
/// assert_eq!(destination.port(), Some(443));
/// assert_eq!(destination.to_string(), "management.azure.com:443");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: Option<u16>,
}

impl Destination {
    /// Create a destination from already separated parts
    #[must_use]
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self {
            host: host.to_lowercase(),
            port,
        }
    }

    /// The lower-cased host name (IPv6 addresses keep their brackets)
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The explicit port, if one was configured
    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        self.port
    }

    /// Check whether a request target falls under this destination.
    ///
    /// Hosts must be equal (case-insensitive). Ports are only compared when
    /// both sides carry one; an absent port on either side matches any port.
    #[must_use]
    pub fn matches(&self, host: &str, port: Option<u16>) -> bool {
        if !self.host.eq_ignore_ascii_case(host) {
            return false;
        }
        match (self.port, port) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Destination of a request URL, keeping only an explicitly written port
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidUrlHost`] if the URL has no host.
    pub fn from_url(url: &reqwest::Url) -> Result<Self> {
        let host = url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;
        Ok(Self::new(host, url.port()))
    }
}

impl FromStr for Destination {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ErrorKind::InvalidDestination {
            destination: s.to_string(),
            reason: reason.to_string(),
        };

        if s.contains("://") {
            return Err(invalid("expected `host[:port]`, not a URL"));
        }
        if s.contains('@') {
            return Err(invalid("user info is not allowed"));
        }
        let authority = Authority::from_str(s).map_err(|e| invalid(&e.to_string()))?;
        let host = authority.host();
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }

        // `Authority` silently drops ports it cannot parse, so check the raw text
        let port = match authority.as_str()[host.len()..].strip_prefix(':') {
            None => None,
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| invalid(&format!("port `{port}` is not a number in 0..=65535")))?,
            ),
        };

        Ok(Self::new(host, port))
    }
}

impl TryFrom<&str> for Destination {
    type Error = ErrorKind;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

impl Serialize for Destination {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
