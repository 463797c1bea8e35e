#![allow(unreachable_pub)]

mod destination;
mod error;

pub use destination::{DEFAULT_PORT, Destination};
pub use error::ErrorKind;

/// The balancer `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
