//! Diagnostic output. Everything logs through the `log` facade; [`init`]
//! installs `env_logger` as the sink unless the program already has a logger.

use std::{fmt, io::Write};

use env_logger::{Builder, Env};

/// Environment variable holding a filter that overrides the configured one
/// (`env_logger` syntax, e.g. `kdiag=debug`)
pub const LOG_ENV: &str = "KDIAG_LOG";

/// Install `env_logger` with `filter` (or `KDIAG_LOG`, which wins). Returns
/// `false` if a logger was already installed, which is then left alone.
pub fn init(filter: &str) -> bool {
    let mut builder = Builder::from_env(Env::new().filter_or(LOG_ENV, filter));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            buf.timestamp_millis(),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.try_init().is_ok()
}

/// The free-form text sink the rest of the SDK writes diagnostics to
pub fn log_text(args: fmt::Arguments<'_>) {
    log::info!(target: "kdiag", "{args}");
}

/// `log_text(format_args!(...))`
#[macro_export]
macro_rules! log_text {
    ($($arg:tt)*) => {
        $crate::logging::log_text(::std::format_args!($($arg)*))
    };
}
