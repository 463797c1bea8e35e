use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

use crate::verbosity::Verbosity;

/// Initialize `env_logger` for the given verbosity.
///
/// `RUST_LOG`, when set, replaces the filters derived from `-v`/`-q`.
pub(crate) fn init_logging(verbose: &Verbosity) {
    let env = Env::default().filter_or("RUST_LOG", "warn");

    let mut builder = Builder::from_env(env);

    if std::env::var("RUST_LOG").is_err() {
        let level_filter = verbose.log_level_filter();

        // Dependencies such as hyper stay quiet unless asked for explicitly
        builder.filter_level(LevelFilter::Warn.min(level_filter));
        builder
            .filter_module("balancer", level_filter)
            .filter_module("balancer_lib", level_filter);
    }

    builder.format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));
    builder.init();
}
