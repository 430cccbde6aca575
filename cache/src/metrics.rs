use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for the cache.
/// All fields are atomic to allow for lock-free updates.
///
/// Hit, miss and eviction counts are only collected while
/// `collect_access_counts` is enabled, because updating shared counters on
/// every lookup is not free.
#[derive(Debug)]
pub(crate) struct Metrics {
  collect_access_counts: AtomicBool,

  // --- Hit/Miss Ratios ---
  hits: CachePadded<AtomicU64>,
  misses: CachePadded<AtomicU64>,

  // --- Eviction Stats ---
  evictions: CachePadded<AtomicU64>,

  // --- Timestamps for Uptime ---
  created_at: Instant,
}

impl Metrics {
  pub(crate) fn new(collect_access_counts: bool) -> Self {
    Self {
      collect_access_counts: AtomicBool::new(collect_access_counts),
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      evictions: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }

  #[inline]
  fn collecting(&self) -> bool {
    self.collect_access_counts.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn count_hit(&self) {
    if self.collecting() {
      self.hits.fetch_add(1, Ordering::Relaxed);
    }
  }

  #[inline]
  pub(crate) fn count_miss(&self) {
    if self.collecting() {
      self.misses.fetch_add(1, Ordering::Relaxed);
    }
  }

  #[inline]
  pub(crate) fn count_eviction(&self) {
    if self.collecting() {
      self.evictions.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub(crate) fn set_collect_access_counts(&self, collect: bool) {
    self.collect_access_counts.store(collect, Ordering::Relaxed);
  }

  pub(crate) fn collect_access_counts(&self) -> bool {
    self.collecting()
  }

  /// Creates a point-in-time snapshot of the current metrics. The occupancy
  /// figures are supplied by the cache.
  pub(crate) fn snapshot(
    &self,
    max_entries: u64,
    allocated_entries: u64,
    used_entries: u64,
  ) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      collect_access_counts: self.collecting(),
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      evictions: self.evictions.load(Ordering::Relaxed),
      max_entries,
      allocated_entries,
      used_entries,
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Whether hit, miss and eviction counts are currently being collected.
  pub collect_access_counts: bool,
  /// The number of lookups that found the object in the cache.
  pub hits: u64,
  /// The number of lookups that did not.
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// The number of entries evicted to make room for others.
  pub evictions: u64,
  /// The configured maximum number of entries.
  pub max_entries: u64,
  /// The number of slots currently allocated by the replacement policy.
  pub allocated_entries: u64,
  /// The number of objects currently in the cache.
  pub used_entries: u64,
  /// The number of seconds the cache has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("collect_access_counts", &self.collect_access_counts)
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("evictions", &self.evictions)
      .field("max_entries", &self.max_entries)
      .field("allocated_entries", &self.allocated_entries)
      .field("used_entries", &self.used_entries)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
