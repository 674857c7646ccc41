//! embellish-core: Core library for embellish
//!
//! Keeps third-party metadata annotations attached to the focus view of a
//! host-rendered media UI. The host owns the render tree and re-renders it
//! whenever it likes; the engine notices, waits for the view to settle,
//! fetches the data (through a persistent TTL cache) and re-attaches its
//! elements idempotently.
//!
//! # Architecture
//!
//! ```text
//! host mutations / navigation / lifecycle
//!                    ↓
//!          MutationWatch (debounce)
//!                    ↓
//!   RetryScheduler → Reconciler → FetchOrchestrator → TtlCache → KeyValueStore
//!         ↓               ↑
//!      Watchdog ──────────┘
//! ```
//!
//! # Modules
//!
//! - `host`: Render tree, navigation and lifecycle abstractions plus in-memory hosts
//! - `store`: Quota-limited key/value persistence
//! - `cache`: Timestamped TTL cache with oldest-first eviction
//! - `fetch`: Deduplicated, timed-out provider lookups
//! - `target`: Focus view and identity resolution
//! - `annotator`: The plug-in seam for annotation providers
//! - `reconcile`: Idempotent attach/prune of owned elements
//! - `retry`: Linear backoff for not-ready views
//! - `watchdog`: Post-success stability monitor
//! - `watch`: Mutation relevance filtering and debounced triggers
//! - `engine`: Wiring of all of the above
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod annotator;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod host;
pub mod logging;
pub mod reconcile;
pub mod retry;
pub mod session;
pub mod store;
pub mod target;
pub mod watch;
pub mod watchdog;

pub use annotator::{Anchor, Annotator};
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result, StoreError};
pub use session::Session;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
