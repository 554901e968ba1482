//! Tracing bootstrap for the smoke runner.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,feed_engine=debug,feed_smoke=debug";

/// Filter variables consulted after `RUST_LOG`, most specific first.
const FALLBACK_FILTER_VARS: [&str; 2] = ["FEED_SMOKE_LOG", "FEED_LOG"];

/// Install the global subscriber. Calling it again is a no-op.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    FALLBACK_FILTER_VARS
        .iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
