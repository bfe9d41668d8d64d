//! `tracing` setup. Logs go to stderr.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `level` wins over `RUST_LOG`; the default is `info`.
pub fn init(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
