//! Thin wrapper over the `slog` stack so call sites depend on one module.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger at the given level (e.g. "debug",
/// "info"). Panics on a bad level string: there is no server to log the
/// failure with yet.
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("invalid logger configuration");

    config.build_logger().expect("logger construction failed")
}
