use crate::cacheable::Cacheable;
use crate::policy::Callback;

use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A guard proving that the current thread holds the lock of a `CacheEntry`.
/// Functions that require the entry lock take `&mut EntryState` so they can
/// only be called with the guard in hand.
pub(crate) type EntryGuard<'a, C> = MutexGuard<'a, EntryState<C>>;

/// A slot in the identity map. The key never changes; the `Cacheable` behind
/// it is swapped in and out by the cache and the replacement policy.
pub(crate) struct CacheEntry<C: Cacheable> {
  key: C::Key,
  state: Mutex<EntryState<C>>,
  /// Signalled when the identity of the cached object has been set.
  identity_set: Condvar,
}

/// The mutable part of an entry, guarded by the entry lock.
pub(crate) struct EntryState<C: Cacheable> {
  cacheable: Option<Arc<C>>,
  keep_count: u32,
  /// `true` from creation until the owner has finished (or given up)
  /// setting the identity of the cached object.
  setting_identity: bool,
  /// `true` while the entry sits in the background cleaner's queue.
  clean_queued: bool,
  /// Back reference to the replacement policy's slot. Never owning.
  callback: Option<Weak<dyn Callback<C>>>,
}

impl<C: Cacheable> CacheEntry<C> {
  pub(crate) fn new(key: C::Key) -> Self {
    Self {
      key,
      state: Mutex::new(EntryState {
        cacheable: None,
        keep_count: 0,
        setting_identity: true,
        clean_queued: false,
        callback: None,
      }),
      identity_set: Condvar::new(),
    }
  }

  #[inline]
  pub(crate) fn key(&self) -> &C::Key {
    &self.key
  }

  /// Locks the entry for exclusive access.
  #[inline]
  pub(crate) fn lock(&self) -> EntryGuard<'_, C> {
    self.state.lock()
  }

  /// Blocks until no other thread is setting the identity of this entry.
  /// The lock is released while waiting.
  pub(crate) fn wait_until_identity_is_set(&self, guard: &mut EntryGuard<'_, C>) {
    while guard.setting_identity {
      self.identity_set.wait(guard);
    }
  }

  /// Marks the identity as set and wakes up every thread waiting for it.
  pub(crate) fn setting_identity_complete(&self, state: &mut EntryState<C>) {
    state.setting_identity = false;
    self.identity_set.notify_all();
  }
}

impl<C: Cacheable> EntryState<C> {
  /// Increments the keep count. If `accessed` is set, the replacement policy
  /// is told that the entry was used.
  pub(crate) fn keep(&mut self, accessed: bool) {
    self.keep_count += 1;
    if accessed {
      if let Some(callback) = self.callback() {
        callback.access();
      }
    }
  }

  pub(crate) fn unkeep(&mut self) {
    debug_assert!(self.keep_count > 0, "unkeep() on an entry that is not kept");
    self.keep_count = self.keep_count.saturating_sub(1);
  }

  #[inline]
  pub(crate) fn is_kept(&self) -> bool {
    self.keep_count > 0
  }

  #[inline]
  pub(crate) fn keep_count(&self) -> u32 {
    self.keep_count
  }

  /// An entry is valid when it holds an object whose identity is fully set.
  #[inline]
  pub(crate) fn is_valid(&self) -> bool {
    !self.setting_identity && self.cacheable.is_some()
  }

  #[inline]
  pub(crate) fn cacheable(&self) -> Option<&Arc<C>> {
    self.cacheable.as_ref()
  }

  #[inline]
  pub(crate) fn set_cacheable(&mut self, cacheable: Option<Arc<C>>) {
    self.cacheable = cacheable;
  }

  #[inline]
  pub(crate) fn take_cacheable(&mut self) -> Option<Arc<C>> {
    self.cacheable.take()
  }

  /// Returns `true` if `item` is the object held by this entry.
  pub(crate) fn holds(&self, item: &Arc<C>) -> bool {
    self
      .cacheable
      .as_ref()
      .map_or(false, |held| Arc::ptr_eq(held, item))
  }

  pub(crate) fn set_callback(&mut self, callback: Option<Weak<dyn Callback<C>>>) {
    self.callback = callback;
  }

  fn callback(&self) -> Option<Arc<dyn Callback<C>>> {
    self.callback.as_ref().and_then(Weak::upgrade)
  }

  #[inline]
  pub(crate) fn is_clean_queued(&self) -> bool {
    self.clean_queued
  }

  #[inline]
  pub(crate) fn set_clean_queued(&mut self, queued: bool) {
    self.clean_queued = queued;
  }

  /// Detaches the cached object from this entry and hands it back to the
  /// replacement policy, which parks it for reuse by another entry.
  pub(crate) fn free(&mut self) {
    let freed = self.cacheable.take();
    if let Some(callback) = self.callback.take().and_then(|weak| weak.upgrade()) {
      callback.free(freed);
    }
  }
}
