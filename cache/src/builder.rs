use crate::cacheable::{Cacheable, CacheableFactory};
use crate::config::CacheConfig;
use crate::daemon::DaemonService;
use crate::error::BuildError;
use crate::handles::PageCache;
use crate::metrics::Metrics;
use crate::policy::clock::ClockPolicy;
use crate::shared::CacheShared;
use crate::store::ShardedStore;

use core::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// A builder for creating `PageCache` instances.
pub struct CacheBuilder<C: Cacheable, H = ahash::RandomState> {
  name: String,
  initial_size: usize,
  max_size: usize,
  shards: usize,
  hasher: H,
  factory: Option<Arc<dyn CacheableFactory<C>>>,
  daemon: Option<Arc<dyn DaemonService>>,
  clean_queue_size: Option<usize>,
  collect_access_counts: bool,
  reuse_cleaned_slots: bool,
}

// Manual Debug implementation for CacheBuilder.
impl<C: Cacheable, H> fmt::Debug for CacheBuilder<C, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("name", &self.name)
      .field("initial_size", &self.initial_size)
      .field("max_size", &self.max_size)
      .field("shards", &self.shards)
      .field("has_factory", &self.factory.is_some())
      .field("has_daemon", &self.daemon.is_some())
      .field("clean_queue_size", &self.clean_queue_size)
      .finish_non_exhaustive()
  }
}

/// The default number of identity map shards.
fn default_shards() -> usize {
  (num_cpus::get() * 4).max(1).next_power_of_two()
}

// --- General Configuration Methods ---
impl<C: Cacheable, H> CacheBuilder<C, H> {
  /// Sets the name used in log events and errors.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Sets the number of slots reserved up front.
  pub fn initial_size(mut self, initial_size: usize) -> Self {
    self.initial_size = initial_size;
    self
  }

  /// Sets the number of slots the cache tries to stay within. The cache may
  /// briefly hold more when every candidate for eviction is kept or dirty.
  pub fn max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }

  /// Sets the number of identity map shards.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards;
    self
  }

  /// Sets the factory that creates new cached objects when the cache grows.
  pub fn factory<F>(mut self, factory: F) -> Self
  where
    F: CacheableFactory<C> + 'static,
  {
    self.factory = Some(Arc::new(factory));
    self
  }

  /// Cleans dirty objects and shrinks the cache on `daemon` instead of on the
  /// threads that need a free slot.
  pub fn daemon_service(mut self, daemon: Arc<dyn DaemonService>) -> Self {
    self.daemon = Some(daemon);
    self
  }

  /// Sets how many entries may wait for the background cleaner. When the
  /// queue is full, the thread looking for a free slot cleans by itself.
  pub fn clean_queue_size(mut self, size: usize) -> Self {
    self.clean_queue_size = Some(size);
    self
  }

  /// Collects hit, miss and eviction counts from the start.
  pub fn collect_access_counts(mut self, collect: bool) -> Self {
    self.collect_access_counts = collect;
    self
  }

  /// Lets a sweep reuse the slot of a dirty object it has just cleaned
  /// itself. Off by default, in which case the sweep moves on and the cleaned
  /// slot becomes a candidate on the next pass of the hand.
  pub fn reuse_cleaned_slots(mut self, reuse: bool) -> Self {
    self.reuse_cleaned_slots = reuse;
    self
  }
}

// --- Default Constructor ---
impl<C: Cacheable, H: BuildHasher + Default> CacheBuilder<C, H> {
  /// Creates a new `CacheBuilder` with default settings.
  pub fn new() -> Self {
    Self {
      name: CacheConfig::DEFAULT_NAME.to_string(),
      initial_size: 0,
      max_size: CacheConfig::DEFAULT_MAX_SIZE,
      shards: default_shards(),
      hasher: H::default(),
      factory: None,
      daemon: None,
      clean_queue_size: None,
      collect_access_counts: false,
      reuse_cleaned_slots: false,
    }
  }

  /// Creates a builder from a loaded configuration. The factory and the
  /// daemon service still have to be supplied.
  pub fn from_config(config: &CacheConfig) -> Self {
    let mut builder = Self::new()
      .name(config.name.clone())
      .initial_size(config.initial_size)
      .max_size(config.max_size)
      .collect_access_counts(config.collect_access_counts)
      .reuse_cleaned_slots(config.reuse_cleaned_slots);
    if let Some(shards) = config.shards {
      builder = builder.shards(shards);
    }
    builder.clean_queue_size = config.clean_queue_size;
    builder
  }
}

impl<C: Cacheable> Default for CacheBuilder<C, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

// --- Build Methods ---
impl<C, H> CacheBuilder<C, H>
where
  C: Cacheable,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Sets the hasher for the identity map.
  pub fn hasher(mut self, hasher: H) -> Self {
    self.hasher = hasher;
    self
  }

  /// Builds the `PageCache`.
  pub fn build(mut self) -> Result<PageCache<C, H>, BuildError> {
    self.validate()?;
    let factory = self.factory.take().ok_or(BuildError::FactoryRequired)?;

    let clean_queue_size = self
      .clean_queue_size
      .unwrap_or_else(|| (self.max_size / 10).max(1));
    let shards = self.shards.next_power_of_two();

    let policy = ClockPolicy::new(self.initial_size, self.max_size)
      .with_reuse_cleaned(self.reuse_cleaned_slots);

    let shared = Arc::new(CacheShared {
      store: ShardedStore::new(shards, self.initial_size, self.hasher.clone()),
      factory,
      policy: Box::new(policy),
      metrics: Metrics::new(self.collect_access_counts),
      cleaner: RwLock::new(None),
      clean_queue_size,
      max_size: self.max_size,
      stopped: AtomicBool::new(false),
      name: self.name,
    });

    if let Some(daemon) = self.daemon.take() {
      shared.use_daemon_service(daemon);
    }

    debug!(
      cache = %shared.name,
      initial_size = self.initial_size,
      max_size = self.max_size,
      shards,
      "page cache built"
    );
    Ok(PageCache { shared })
  }

  /// Validates the builder configuration.
  pub(crate) fn validate(&self) -> Result<(), BuildError> {
    if self.max_size == 0 {
      return Err(BuildError::ZeroCapacity);
    }
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    if self.clean_queue_size == Some(0) {
      return Err(BuildError::ZeroCleanQueue);
    }
    if self.initial_size > self.max_size {
      return Err(BuildError::InitialSizeTooLarge {
        initial: self.initial_size,
        max: self.max_size,
      });
    }
    Ok(())
  }
}
