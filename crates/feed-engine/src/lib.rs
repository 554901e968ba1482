//! Async runtime of the message feed synchronizer.
//!
//! `FeedController::spawn` starts one actor per feed surface. It owns the
//! message store for the open scope and merges history pages, live inserts
//! and write results into it, publishing a `FeedState` after every change.

use std::time::{SystemTime, UNIX_EPOCH};

/// Environment-backed runtime configuration.
pub mod config;
/// Feed actor and its handle.
pub mod controller;
mod live;
/// Coalescing history loader.
pub mod loader;
mod send;
mod signal;

pub use config::{ConfigError, FeedConfig};
pub use controller::{FeedController, FeedHandle};
pub use live::decode_push_event;
pub use loader::{MAX_PAGE_SIZE, PaginationLoader, bounded_page_size};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
