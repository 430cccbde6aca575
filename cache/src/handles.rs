use crate::cacheable::Cacheable;
use crate::daemon::DaemonService;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::metrics::MetricsSnapshot;
use crate::shared::CacheShared;

use std::fmt;
use std::hash::BuildHasher;
use std::ops::Deref;
use std::sync::Arc;

/// A thread-safe page cache.
///
/// Cloning the handle is cheap; all clones share the same cache.
pub struct PageCache<C: Cacheable, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<C, H>>,
}

impl<C: Cacheable, H> Clone for PageCache<C, H> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<C: Cacheable, H> fmt::Debug for PageCache<C, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PageCache")
      .field("shared", &self.shared)
      .finish()
  }
}

impl<C, H> PageCache<C, H>
where
  C: Cacheable,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Finds the object identified by `key`, reading it into the cache on a miss.
  ///
  /// The object is kept until the returned handle is released or dropped.
  /// Returns `Ok(None)` if no such object exists.
  ///
  /// If another thread is loading the same key, this call waits for it and
  /// returns the same object.
  pub fn find(&self, key: &C::Key) -> Result<Option<Pinned<C, H>>, CacheError> {
    let found = self.shared.find(key)?;
    Ok(found.map(|(entry, item)| Pinned::new(self.shared.clone(), entry, item)))
  }

  /// Like [`find`](Self::find), but never reads anything into the cache.
  pub fn find_cached(&self, key: &C::Key) -> Result<Option<Pinned<C, H>>, CacheError> {
    let found = self.shared.find_cached(key)?;
    Ok(found.map(|(entry, item)| Pinned::new(self.shared.clone(), entry, item)))
  }

  /// Adds a brand new object under `key`.
  ///
  /// Fails with [`CacheError::ObjectExists`] if the key is already cached.
  pub fn create(&self, key: &C::Key) -> Result<Pinned<C, H>, CacheError> {
    let (entry, item) = self.shared.create(key)?;
    Ok(Pinned::new(self.shared.clone(), entry, item))
  }

  /// Writes back the object for `key` if it is dirty, then removes it.
  ///
  /// Returns `Ok(false)` if the key is not cached, and
  /// [`CacheError::Contention`] if someone keeps it.
  pub fn remove(&self, key: &C::Key) -> Result<bool, CacheError> {
    self.shared.remove(key)
  }

  /// Writes back every dirty object. Stops at the first failure.
  pub fn clean_all(&self) -> Result<(), CacheError> {
    self.shared.clean_cache(|_| true)
  }

  /// Writes back every dirty object whose key matches `matches`.
  pub fn clean_matching<F>(&self, matches: F) -> Result<(), CacheError>
  where
    F: FnMut(&C::Key) -> bool,
  {
    self.shared.clean_cache(matches)
  }

  /// Removes every object that is neither kept nor dirty.
  pub fn age_out(&self) {
    self.shared.age_out();
  }

  /// Drops every unkept object whose key matches `matches`, without writing
  /// it back. Returns `false` if some matching object was kept.
  pub fn discard<F>(&self, matches: F) -> bool
  where
    F: FnMut(&C::Key) -> bool,
  {
    self.shared.discard(matches)
  }

  /// A snapshot of the objects currently in the cache.
  pub fn values(&self) -> Vec<Arc<C>> {
    self.shared.values()
  }

  /// Returns `true` if an object for `key` is currently cached.
  pub fn contains(&self, key: &C::Key) -> bool {
    self.shared.contains(key)
  }

  /// Runs one pass that tries to bring the number of slots back down to the
  /// maximum size.
  pub fn shrink(&self) {
    self.shared.policy.do_shrink(&*self.shared);
  }

  /// Stops the cache. Everything dirty is written back and every unkept
  /// object removed. Lookups fail with [`CacheError::ShutDown`] afterwards.
  pub fn shutdown(&self) -> Result<(), CacheError> {
    self.shared.shutdown()
  }

  /// Moves cleaning of dirty objects and shrinking onto `daemon`.
  pub fn use_daemon_service(&self, daemon: Arc<dyn DaemonService>) {
    self.shared.use_daemon_service(daemon);
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// The configured maximum number of entries.
  pub fn max_entries(&self) -> usize {
    self.shared.max_size
  }

  /// The number of slots allocated by the replacement policy. May exceed
  /// [`max_entries`](Self::max_entries) while the cache is under pressure.
  pub fn allocated_entries(&self) -> usize {
    self.shared.allocated_entries()
  }

  /// The number of objects currently in the cache.
  pub fn used_entries(&self) -> usize {
    self.shared.used_entries()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics_snapshot()
  }

  /// Enables or disables collection of hit, miss and eviction counts.
  pub fn set_collect_access_counts(&self, collect: bool) {
    self.shared.metrics.set_collect_access_counts(collect);
  }

  pub fn collect_access_counts(&self) -> bool {
    self.shared.metrics.collect_access_counts()
  }
}

/// An object kept in the cache on behalf of the holder of this handle.
///
/// The object cannot be evicted while the handle exists. Dropping the handle
/// releases the keep.
#[must_use = "dropping a Pinned handle releases it immediately"]
pub struct Pinned<C: Cacheable, H = ahash::RandomState> {
  cache: Arc<CacheShared<C, H>>,
  entry: Arc<CacheEntry<C>>,
  item: Arc<C>,
  released: bool,
}

impl<C: Cacheable, H> Pinned<C, H> {
  fn new(cache: Arc<CacheShared<C, H>>, entry: Arc<CacheEntry<C>>, item: Arc<C>) -> Self {
    Self {
      cache,
      entry,
      item,
      released: false,
    }
  }

  pub fn key(&self) -> &C::Key {
    self.entry.key()
  }

  /// A shared reference to the object that outlives this handle. The object
  /// may be evicted and reused for another key once the handle is released.
  pub fn object(&self) -> Arc<C> {
    self.item.clone()
  }

  /// Releases the keep. Equivalent to dropping the handle.
  pub fn release(self) {
    drop(self);
  }
}

impl<C, H> Pinned<C, H>
where
  C: Cacheable,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Writes back and removes the object.
  ///
  /// Fails with [`CacheError::Contention`] if other handles keep the same
  /// object. On failure the keep is released and the object stays cached.
  pub fn remove(mut self) -> Result<(), CacheError> {
    self.cache.remove_kept(&self.entry, &self.item)?;
    self.released = true;
    Ok(())
  }
}

impl<C: Cacheable, H> Deref for Pinned<C, H> {
  type Target = C;

  fn deref(&self) -> &C {
    &self.item
  }
}

impl<C: Cacheable, H> fmt::Debug for Pinned<C, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pinned")
      .field("key", self.entry.key())
      .finish_non_exhaustive()
  }
}

impl<C: Cacheable, H> Drop for Pinned<C, H> {
  fn drop(&mut self) {
    if !self.released {
      self.entry.lock().unkeep();
    }
  }
}
