use std::hash::Hash;
use std::fmt;

use thiserror::Error;

/// Possible errors when routing requests through a `balancer_lib` pool
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The configured destination is not a valid `host[:port]` string
    #[error("Invalid destination `{destination}`: {reason}")]
    InvalidDestination {
        /// The destination string as given
        destination: String,
        /// Why it was rejected
        reason: String,
    },

    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two pools were registered for the same destination
    #[error("Destination `{0}` is already served by another pool")]
    DuplicateDestination(String),

    /// Pools spawn background tasks and must be created inside a Tokio runtime
    #[error("Pools must be created from within a Tokio runtime")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// The request targets a destination this pool or router does not serve
    #[error(
        "Host `{requested}` is not supported by the configured balancer, supported destinations: {}",
        FormatList(.supported)
    )]
    UnsupportedDestination {
        /// Host (and port, if any) of the rejected request
        requested: String,
        /// Destinations that would have been accepted
        supported: Vec<String>,
    },

    /// The request URL carries no host at all
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The caller gave up while waiting for a connection or a response
    #[error("Request was cancelled before it completed")]
    Cancelled,

    /// The pool is shutting down or already closed
    #[error("Connection pool is shut down and cannot accept requests")]
    PoolUnavailable,

    /// Reqwest network error, passed through from the transport
    #[error("Network error while executing request")]
    NetworkRequest(#[source] reqwest::Error),

    /// Error reported by a custom transport, passed through untouched
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The reqwest client for a fresh connection handle could not be built
    #[error("Error creating request client: {0}")]
    BuildRequestClient(#[source] reqwest::Error),

    /// Some connection handles failed to close during shutdown
    #[error("{} connection handle(s) failed to close during shutdown", .0.len())]
    Shutdown(Vec<ErrorKind>),

    /// A background recycle or producer task panicked
    #[error("Background task failed: {0}")]
    BackgroundTask(#[from] tokio::task::JoinError),
}

impl ErrorKind {
    /// Returns `true` if the request was rejected because of its destination.
    ///
    /// These errors are never worth retrying against the same pool.
    #[must_use]
    pub const fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedDestination { .. } | Self::InvalidUrlHost
        )
    }

    /// Returns `true` if the caller's own cancellation ended the request
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the pool could not serve the request because it is
    /// shutting down
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::PoolUnavailable)
    }

    /// Wrap any error from a custom transport
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Transport(error.into())
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::InvalidDestination {
                    destination: d1,
                    reason: r1,
                },
                Self::InvalidDestination {
                    destination: d2,
                    reason: r2,
                },
            ) => d1 == d2 && r1 == r2,
            (Self::InvalidConfig(s1), Self::InvalidConfig(s2))
            | (Self::DuplicateDestination(s1), Self::DuplicateDestination(s2)) => s1 == s2,
            (
                Self::UnsupportedDestination {
                    requested: r1,
                    supported: s1,
                },
                Self::UnsupportedDestination {
                    requested: r2,
                    supported: s2,
                },
            ) => r1 == r2 && s1 == s2,
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2))
            | (Self::BuildRequestClient(e1), Self::BuildRequestClient(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::Transport(e1), Self::Transport(e2)) => e1.to_string() == e2.to_string(),
            (Self::Shutdown(e1), Self::Shutdown(e2)) => e1 == e2,
            (Self::Runtime(_), Self::Runtime(_))
            | (Self::InvalidUrlHost, Self::InvalidUrlHost)
            | (Self::Cancelled, Self::Cancelled)
            | (Self::PoolUnavailable, Self::PoolUnavailable) => true,
            (Self::BackgroundTask(e1), Self::BackgroundTask(e2)) => {
                e1.to_string() == e2.to_string()
            }
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Hash for ErrorKind {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::InvalidDestination {
                destination,
                reason,
            } => (destination, reason).hash(state),
            Self::InvalidConfig(s) | Self::DuplicateDestination(s) => s.hash(state),
            Self::UnsupportedDestination {
                requested,
                supported,
            } => (requested, supported).hash(state),
            Self::NetworkRequest(e) | Self::BuildRequestClient(e) => e.to_string().hash(state),
            Self::Transport(e) => e.to_string().hash(state),
            Self::BackgroundTask(e) => e.to_string().hash(state),
            Self::Shutdown(errors) => errors.hash(state),
            Self::Runtime(_) | Self::InvalidUrlHost | Self::Cancelled | Self::PoolUnavailable => {}
        }
    }
}

/// Renders a list of destinations as `` `a`, `b` ``
struct FormatList<'a>(&'a [String]);

impl fmt::Display for FormatList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<none>");
        }
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "`{item}`")?;
        }
        Ok(())
    }
}
