use crate::cacheable::{Cacheable, CacheableFactory};
use crate::daemon::DaemonService;
use crate::entry::{CacheEntry, EntryGuard, EntryState};
use crate::error::CacheError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::policy::ReplacementPolicy;
use crate::store::ShardedStore;
use crate::task::cleaner::BackgroundCleaner;

use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, trace};

/// The operations the replacement policy and the background cleaner need from
/// the cache that owns them.
pub(crate) trait CacheContext<C: Cacheable>: Send + Sync {
  /// Forgets `entry`, whose slot was just taken away by the policy. `item` is
  /// the object it held. Called with the lock of `entry` held.
  fn evict_entry(&self, entry: &Arc<CacheEntry<C>>, item: &Arc<C>);

  fn background_cleaner(&self) -> Option<Arc<BackgroundCleaner<C>>>;

  /// Cleans the object in `entry` if it is still cached and dirty. Takes the
  /// entry lock itself.
  fn clean_entry(&self, entry: &Arc<CacheEntry<C>>) -> Result<(), CacheError>;

  /// Cleans `item`, which the caller has kept, then unkeeps its entry. The
  /// entry must not be locked by the caller.
  fn clean_and_unkeep_entry(&self, entry: &Arc<CacheEntry<C>>, item: Arc<C>) -> Result<(), CacheError>;

  /// Runs one shrink pass of the replacement policy.
  fn shrink(&self);
}

/// What a lookup found under the entry lock.
enum Lookup<C> {
  /// A valid object, already kept for the caller.
  Hit(Arc<C>),
  /// A slot for a new object whose identity the caller must now set.
  Miss(Arc<C>),
}

/// The internal, thread-safe core of the cache.
pub(crate) struct CacheShared<C: Cacheable, H> {
  pub(crate) name: String,
  pub(crate) store: ShardedStore<C, H>,
  pub(crate) factory: Arc<dyn CacheableFactory<C>>,
  pub(crate) policy: Box<dyn ReplacementPolicy<C>>,
  pub(crate) metrics: Metrics,
  pub(crate) cleaner: RwLock<Option<Arc<BackgroundCleaner<C>>>>,
  pub(crate) clean_queue_size: usize,
  pub(crate) max_size: usize,
  pub(crate) stopped: AtomicBool,
}

impl<C: Cacheable, H> fmt::Debug for CacheShared<C, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheShared")
      .field("name", &self.name)
      .field("max_size", &self.max_size)
      .field("allocated", &self.policy.size())
      .field("stopped", &self.stopped.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl<C: Cacheable, H> Drop for CacheShared<C, H> {
  fn drop(&mut self) {
    if let Some(cleaner) = self.cleaner.get_mut().take() {
      cleaner.unsubscribe();
    }
  }
}

impl<C, H> CacheShared<C, H>
where
  C: Cacheable,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  fn check_running(&self) -> Result<(), CacheError> {
    if self.stopped.load(Ordering::Acquire) {
      return Err(CacheError::ShutDown {
        cache: self.name.clone(),
      });
    }
    Ok(())
  }

  /// Finds the entry for `key` and runs `f` with its lock held.
  ///
  /// The entry passed to `f` is either valid, or fresh and mapped by this call;
  /// in the latter case the caller is responsible for setting its identity.
  fn get_entry<R>(
    &self,
    key: &C::Key,
    f: impl FnOnce(&Arc<CacheEntry<C>>, &mut EntryGuard<'_, C>) -> R,
  ) -> R {
    let mut found = self.store.get(key);
    loop {
      if let Some(entry) = found.take() {
        let mut state = entry.lock();
        entry.wait_until_identity_is_set(&mut state);
        if state.is_valid() {
          return f(&entry, &mut state);
        }
        // Removed while we waited. Its mapping is gone, so try a fresh one.
      }

      let fresh = Arc::new(CacheEntry::new(key.clone()));
      let mut state = fresh.lock();
      match self.store.insert_if_absent(&fresh) {
        Ok(()) => return f(&fresh, &mut state),
        Err(existing) => found = Some(existing),
      }
    }
  }

  /// Gets a slot from the replacement policy for a fresh entry and keeps it.
  /// Returns the object whose identity must be set next.
  ///
  /// If no slot can be found, the entry is removed again and its waiters are
  /// released.
  fn insert_into_free_slot(
    &self,
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
  ) -> Result<Arc<C>, CacheError> {
    if let Err(err) = self.policy.insert_entry(self, entry, state) {
      self.remove_entry(entry, state);
      entry.setting_identity_complete(state);
      return Err(err);
    }

    let item = match state.cacheable() {
      Some(recycled) => recycled.clone(),
      None => {
        let item = Arc::new(self.factory.new_cacheable());
        state.set_cacheable(Some(item.clone()));
        item
      }
    };
    state.keep(true);
    Ok(item)
  }

  /// Publishes the outcome of setting the identity of a fresh entry. A failed
  /// entry is removed, and its object parked in the slot for reuse.
  fn setting_identity_complete(&self, entry: &Arc<CacheEntry<C>>, success: bool) {
    let mut state = entry.lock();
    if !success {
      self.remove_entry(entry, &mut state);
    }
    entry.setting_identity_complete(&mut state);
  }

  /// Unmaps `entry` and hands its slot back to the replacement policy. The
  /// caller holds the entry lock.
  fn remove_entry(&self, entry: &Arc<CacheEntry<C>>, state: &mut EntryState<C>) {
    self.store.remove_if_same(entry);
    if let Some(item) = state.cacheable() {
      if item.identity().is_some() {
        item.clear_identity();
      }
    }
    state.free();
  }

  /// Writes back the object of `entry` before it is removed, if it is dirty.
  fn clean_for_remove(&self, entry: &Arc<CacheEntry<C>>, state: &EntryState<C>) -> Result<(), CacheError> {
    match state.cacheable() {
      Some(item) if item.is_dirty() => item
        .clean(true)
        .map_err(|err| CacheError::storage(entry.key(), err)),
      _ => Ok(()),
    }
  }

  /// Finds the object for `key`, loading it into a free slot on a miss.
  /// Returns `None` if the object does not exist.
  pub(crate) fn find(&self, key: &C::Key) -> Result<Option<(Arc<CacheEntry<C>>, Arc<C>)>, CacheError> {
    self.check_running()?;

    let (entry, lookup) = self.get_entry(key, |entry, state| -> Result<_, CacheError> {
      if state.is_valid() {
        if let Some(item) = state.cacheable().cloned() {
          state.keep(true);
          self.metrics.count_hit();
          return Ok((entry.clone(), Lookup::Hit(item)));
        }
      }
      self.metrics.count_miss();
      let item = self.insert_into_free_slot(entry, state)?;
      Ok((entry.clone(), Lookup::Miss(item)))
    })?;

    let item = match lookup {
      Lookup::Hit(item) => return Ok(Some((entry, item))),
      Lookup::Miss(item) => item,
    };

    // Reading the object may block on I/O, so it happens without the entry
    // lock. Other threads asking for this key wait for it to complete.
    let outcome = item.set_identity(key);
    self.setting_identity_complete(&entry, matches!(outcome, Ok(true)));
    match outcome {
      Ok(true) => Ok(Some((entry, item))),
      Ok(false) => Ok(None),
      Err(err) => Err(CacheError::storage(key, err)),
    }
  }

  /// Returns the object for `key` only if it is already cached.
  pub(crate) fn find_cached(&self, key: &C::Key) -> Result<Option<(Arc<CacheEntry<C>>, Arc<C>)>, CacheError> {
    self.check_running()?;

    let entry = match self.store.get(key) {
      Some(entry) => entry,
      None => {
        self.metrics.count_miss();
        return Ok(None);
      }
    };

    let mut state = entry.lock();
    entry.wait_until_identity_is_set(&mut state);
    match state.cacheable().cloned() {
      Some(item) if state.is_valid() => {
        state.keep(true);
        self.metrics.count_hit();
        drop(state);
        Ok(Some((entry, item)))
      }
      _ => {
        self.metrics.count_miss();
        Ok(None)
      }
    }
  }

  /// Adds a brand new object under `key`.
  pub(crate) fn create(&self, key: &C::Key) -> Result<(Arc<CacheEntry<C>>, Arc<C>), CacheError> {
    self.check_running()?;

    // Nobody can use the entry before its identity is set, so it may be
    // mapped before it is locked.
    let entry = Arc::new(CacheEntry::new(key.clone()));
    if self.store.insert_if_absent(&entry).is_err() {
      return Err(CacheError::ObjectExists {
        cache: self.name.clone(),
        key: format!("{:?}", key),
      });
    }

    let item = {
      let mut state = entry.lock();
      self.insert_into_free_slot(&entry, &mut state)?
    };

    let outcome = item.create_identity(key);
    self.setting_identity_complete(&entry, outcome.is_ok());
    outcome.map_err(|err| CacheError::storage(key, err))?;
    Ok((entry, item))
  }

  /// Removes the object for `key` after cleaning it. Fails if it is kept.
  pub(crate) fn remove(&self, key: &C::Key) -> Result<bool, CacheError> {
    let entry = match self.store.get(key) {
      Some(entry) => entry,
      None => return Ok(false),
    };

    let mut state = entry.lock();
    entry.wait_until_identity_is_set(&mut state);
    if !state.is_valid() {
      return Ok(false);
    }
    if state.is_kept() {
      return Err(CacheError::contention(key));
    }

    self.clean_for_remove(&entry, &state)?;
    self.remove_entry(&entry, &mut state);
    debug!(cache = %self.name, ?key, "removed entry");
    Ok(true)
  }

  /// Removes an object the caller has kept. The caller's keep must be the only
  /// one. On success the keep is consumed.
  pub(crate) fn remove_kept(&self, entry: &Arc<CacheEntry<C>>, item: &Arc<C>) -> Result<(), CacheError> {
    let mut state = entry.lock();
    debug_assert!(state.holds(item), "kept entry lost its object");
    if state.keep_count() > 1 {
      return Err(CacheError::contention(entry.key()));
    }

    self.clean_for_remove(entry, &state)?;
    state.unkeep();
    self.remove_entry(entry, &mut state);
    debug!(cache = %self.name, key = ?entry.key(), "removed kept entry");
    Ok(())
  }

  /// Cleans every dirty object whose key matches `matches`. Stops at the first
  /// failure.
  pub(crate) fn clean_cache(&self, mut matches: impl FnMut(&C::Key) -> bool) -> Result<(), CacheError> {
    for entry in self.store.entries() {
      let dirty = {
        let mut state = entry.lock();
        if !state.is_valid() || !matches(entry.key()) {
          continue;
        }
        match state.cacheable().cloned() {
          Some(item) if item.is_dirty() => {
            state.keep(false);
            item
          }
          _ => continue,
        }
      };
      self.clean_and_unkeep_entry(&entry, dirty)?;
    }
    Ok(())
  }

  /// Removes every object that is neither kept nor dirty.
  pub(crate) fn age_out(&self) {
    let mut removed = 0usize;
    for entry in self.store.entries() {
      let mut state = entry.lock();
      if state.is_kept() || !state.is_valid() {
        continue;
      }
      if state.cacheable().map_or(true, |item| item.is_dirty()) {
        continue;
      }
      self.remove_entry(&entry, &mut state);
      removed += 1;
    }
    debug!(cache = %self.name, removed, "aged out entries");
  }

  /// Removes every unkept object whose key matches `matches` without cleaning
  /// it. Returns `false` if a matching object was kept and had to stay.
  pub(crate) fn discard(&self, mut matches: impl FnMut(&C::Key) -> bool) -> bool {
    let mut all_removed = true;
    for entry in self.store.entries() {
      let mut state = entry.lock();
      if state.cacheable().is_none() || !matches(entry.key()) {
        continue;
      }
      if state.is_kept() {
        all_removed = false;
        continue;
      }
      self.remove_entry(&entry, &mut state);
    }
    all_removed
  }

  /// A snapshot of the objects currently in the cache.
  pub(crate) fn values(&self) -> Vec<Arc<C>> {
    self
      .store
      .entries()
      .into_iter()
      .filter_map(|entry| {
        let state = entry.lock();
        if state.is_valid() {
          state.cacheable().cloned()
        } else {
          None
        }
      })
      .collect()
  }

  /// Stops handing out objects, writes back everything dirty and empties the
  /// cache as far as pins allow.
  pub(crate) fn shutdown(&self) -> Result<(), CacheError> {
    self.stopped.store(true, Ordering::Release);
    let result = self.clean_cache(|_| true);
    self.age_out();
    if let Some(cleaner) = self.cleaner.write().take() {
      cleaner.unsubscribe();
    }
    info!(cache = %self.name, "cache shut down");
    result
  }

  /// Starts cleaning dirty objects on `daemon`, replacing any previous cleaner.
  pub(crate) fn use_daemon_service(self: &Arc<Self>, daemon: Arc<dyn DaemonService>) {
    let weak: Weak<Self> = Arc::downgrade(self);
    let cleaner = BackgroundCleaner::spawn(weak, daemon, self.clean_queue_size);
    let previous = self.cleaner.write().replace(cleaner);
    if let Some(previous) = previous {
      previous.unsubscribe();
    }
    debug!(cache = %self.name, queue_size = self.clean_queue_size, "background cleaner installed");
  }

  pub(crate) fn contains(&self, key: &C::Key) -> bool {
    match self.store.get(key) {
      Some(entry) => {
        let state = entry.lock();
        state.is_valid()
      }
      None => false,
    }
  }

  pub(crate) fn allocated_entries(&self) -> usize {
    self.policy.size()
  }

  pub(crate) fn used_entries(&self) -> usize {
    self.store.len()
  }

  pub(crate) fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot(
      self.max_size as u64,
      self.allocated_entries() as u64,
      self.used_entries() as u64,
    )
  }
}

impl<C, H> CacheContext<C> for CacheShared<C, H>
where
  C: Cacheable,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  fn evict_entry(&self, entry: &Arc<CacheEntry<C>>, item: &Arc<C>) {
    self.store.remove_if_same(entry);
    item.clear_identity();
    self.metrics.count_eviction();
    trace!(cache = %self.name, key = ?entry.key(), "evicted entry");
  }

  fn background_cleaner(&self) -> Option<Arc<BackgroundCleaner<C>>> {
    self.cleaner.read().clone()
  }

  fn clean_entry(&self, entry: &Arc<CacheEntry<C>>) -> Result<(), CacheError> {
    let item = {
      let mut state = entry.lock();
      state.set_clean_queued(false);
      if !state.is_valid() {
        return Ok(());
      }
      match state.cacheable().cloned() {
        Some(item) if item.is_dirty() => {
          state.keep(false);
          item
        }
        _ => return Ok(()),
      }
    };
    self.clean_and_unkeep_entry(entry, item)
  }

  fn clean_and_unkeep_entry(&self, entry: &Arc<CacheEntry<C>>, item: Arc<C>) -> Result<(), CacheError> {
    let result = if item.is_dirty() {
      item
        .clean(false)
        .map_err(|err| CacheError::storage(entry.key(), err))
    } else {
      Ok(())
    };
    entry.lock().unkeep();
    result
  }

  fn shrink(&self) {
    self.policy.do_shrink(self);
  }
}
