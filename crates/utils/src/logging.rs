//! Process-wide tracing setup

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Installs the global subscriber: `RUST_LOG` directives, `INFO` otherwise.
pub fn init() {
    init_with_default(LevelFilter::INFO);
}

/// Like [`init`], with a different level when `RUST_LOG` is unset.
///
/// A second call is a no-op, so tests and embedding binaries may both call it.
pub fn init_with_default(level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    if registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
