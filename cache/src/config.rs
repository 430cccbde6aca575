//! Plain configuration for a page cache, for applications that load their
//! settings from a file.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Settings that can seed a [`CacheBuilder`](crate::CacheBuilder) through
/// [`CacheBuilder::from_config`](crate::CacheBuilder::from_config).
///
/// Missing fields take their default values when deserialized.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
  /// A name used in log events and errors.
  pub name: String,
  /// The number of slots reserved up front.
  pub initial_size: usize,
  /// The number of slots the cache tries to stay within.
  pub max_size: usize,
  /// The number of identity map shards. `None` picks a value from the number
  /// of CPUs.
  pub shards: Option<usize>,
  /// The capacity of the background clean queue. `None` means a tenth of
  /// `max_size`.
  pub clean_queue_size: Option<usize>,
  /// Whether hit, miss and eviction counts are collected from the start.
  pub collect_access_counts: bool,
  /// Whether a slot whose dirty object was just cleaned by the sweeping thread
  /// may be reused by that same sweep.
  pub reuse_cleaned_slots: bool,
}

impl CacheConfig {
  pub const DEFAULT_NAME: &'static str = "PageCache";
  pub const DEFAULT_MAX_SIZE: usize = 1000;
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: Self::DEFAULT_NAME.to_string(),
      initial_size: 0,
      max_size: Self::DEFAULT_MAX_SIZE,
      shards: None,
      clean_queue_size: None,
      collect_access_counts: false,
      reuse_cleaned_slots: false,
    }
  }
}
