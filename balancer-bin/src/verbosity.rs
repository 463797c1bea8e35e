//! `-v` / `-q` flags shared by the command line and the config file.
//!
//! Without flags `balancer` logs at info level, so recycle events show up.
//! - `-q` only warnings, `-qq` only errors
//! - `-v` debug (slot swaps, drains, producer activity)
//! - `-vv` trace (slot choice per request)

use log::{Level, LevelFilter};
use serde::Deserialize;
use std::fmt;

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Verbosity {
    /// Log more, pass several times for debug and trace output
    #[arg(
        long,
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "quiet",
    )]
    verbose: u8,

    /// Log less, pass twice to only see errors
    #[arg(
        long,
        short = 'q',
        action = clap::ArgAction::Count,
        global = true,
        conflicts_with = "verbose",
    )]
    quiet: u8,
}

impl Verbosity {
    /// Level selected by the flags
    pub(crate) const fn log_level(&self) -> Level {
        level_enum(self.verbosity())
    }

    pub(crate) fn log_level_filter(&self) -> LevelFilter {
        self.log_level().to_level_filter()
    }

    #[allow(clippy::cast_possible_wrap)]
    const fn verbosity(&self) -> i8 {
        level_value(Level::Info) - (self.quiet as i8) + (self.verbose as i8)
    }
}

// Accepts level names such as "debug", "warn" or "Warning" in the config file
impl<'de> Deserialize<'de> for Verbosity {
    #[allow(clippy::cast_sign_loss)]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let level = match s.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" | "warning" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            level => {
                return Err(serde::de::Error::custom(format!(
                    "invalid log level `{level}`"
                )));
            }
        };

        let offset = level_value(level) - level_value(Level::Info);
        Ok(if offset >= 0 {
            Verbosity {
                verbose: offset as u8,
                quiet: 0,
            }
        } else {
            Verbosity {
                verbose: 0,
                quiet: (-offset) as u8,
            }
        })
    }
}

const fn level_value(level: Level) -> i8 {
    match level {
        Level::Error => 0,
        Level::Warn => 1,
        Level::Info => 2,
        Level::Debug => 3,
        Level::Trace => 4,
    }
}

const fn level_enum(verbosity: i8) -> Level {
    match verbosity {
        i8::MIN..=0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.log_level())
    }
}
