//! A concurrent page cache built around a clock (second-chance) replacement
//! policy, designed to sit between a storage engine and its on-disk pages.
//!
//! # Features
//! - **Fine-grained locking**: every cached entry and every clock slot has its
//!   own lock, so threads working on different pages never block each other.
//! - **Pinning**: objects handed out by the cache are kept (pinned) until the
//!   returned [`Pinned`] handle is released, and are never evicted meanwhile.
//! - **Write-back**: dirty pages are cleaned before their slot is reused,
//!   either inline or by a background cleaner running on an injected
//!   [`DaemonService`].
//! - **Soft capacity**: the clock grows past its maximum size rather than
//!   block, and shrinks back when pressure drops.
//! - **Observability**: exposes hit/miss/eviction counters and occupancy.

// Public modules that form the API
pub mod builder;
pub mod cacheable;
pub mod config;
pub mod daemon;
pub mod error;
pub mod handles;
pub mod metrics;

// Internal, crate-only modules
mod entry;
mod policy;
mod shared;
mod store;
mod task;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the primary user-facing types for convenience
pub use builder::CacheBuilder;
pub use cacheable::{Cacheable, CacheableFactory};
pub use config::CacheConfig;
pub use daemon::{DaemonService, Serviceable, SubscriptionToken, ThreadDaemon, WorkStatus};
pub use error::{BoxError, BuildError, CacheError};
pub use handles::{PageCache, Pinned};
pub use metrics::MetricsSnapshot;
