use crate::cacheable::Cacheable;
use crate::entry::{CacheEntry, EntryState};
use crate::policy::Callback;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// The number of free holders, shared between the clock and its holders.
pub(crate) type FreeCount = Arc<CachePadded<AtomicUsize>>;

/// One slot on the clock face.
///
/// A holder is in exactly one of three states: it owns an entry, it is free
/// (possibly with a parked `Cacheable` waiting to be reused), or it is
/// evicted. Evicted is terminal.
///
/// Lock order: an entry lock may be held when a holder lock is taken, never
/// the other way around.
pub(crate) struct Holder<C: Cacheable> {
  /// Set on access, cleared by the clock hand. Only touched with the lock of
  /// the owning entry held.
  recently_used: AtomicBool,
  slot: Mutex<Slot<C>>,
  free_entries: FreeCount,
}

struct Slot<C: Cacheable> {
  entry: Option<Arc<CacheEntry<C>>>,
  freed: Option<Arc<C>>,
  evicted: bool,
}

impl<C: Cacheable> Holder<C> {
  /// Creates a holder owning `entry` and points the entry back at it.
  pub(crate) fn new(
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
    free_entries: FreeCount,
  ) -> Arc<Self> {
    let holder = Arc::new(Self {
      recently_used: AtomicBool::new(false),
      slot: Mutex::new(Slot {
        entry: Some(entry.clone()),
        freed: None,
        evicted: false,
      }),
      free_entries,
    });
    state.set_callback(Some(holder.as_callback()));
    holder
  }

  fn as_callback(self: &Arc<Self>) -> Weak<dyn Callback<C>> {
    let weak: Weak<Self> = Arc::downgrade(self);
    weak
  }

  /// The entry currently owning this holder, if any.
  pub(crate) fn entry(&self) -> Option<Arc<CacheEntry<C>>> {
    self.slot.lock().entry.clone()
  }

  pub(crate) fn is_owned_by(&self, entry: &Arc<CacheEntry<C>>) -> bool {
    self
      .slot
      .lock()
      .entry
      .as_ref()
      .map_or(false, |owner| Arc::ptr_eq(owner, entry))
  }

  /// Clears the recently-used bit, returning its previous value.
  #[inline]
  pub(crate) fn clear_recently_used(&self) -> bool {
    self.recently_used.swap(false, Ordering::Relaxed)
  }

  #[cfg(test)]
  pub(crate) fn is_recently_used(&self) -> bool {
    self.recently_used.load(Ordering::Relaxed)
  }

  /// Claims this holder for `entry` if it is free and not evicted. The parked
  /// object, if any, is moved into the entry.
  ///
  /// Returns `false` if another thread got here first.
  pub(crate) fn take_if_free(
    self: &Arc<Self>,
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
  ) -> bool {
    let mut slot = self.slot.lock();
    if slot.entry.is_some() || slot.evicted {
      return false;
    }

    self.free_entries.fetch_sub(1, Ordering::AcqRel);
    state.set_cacheable(slot.freed.take());
    state.set_callback(Some(self.as_callback()));
    slot.entry = Some(entry.clone());
    true
  }

  /// Hands this holder over from the evictable entry behind `victim` to
  /// `entry`, moving the cached object along with it.
  ///
  /// The caller holds the locks of both entries.
  pub(crate) fn switch_entry(
    self: &Arc<Self>,
    victim: &mut EntryState<C>,
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
  ) {
    let mut slot = self.slot.lock();
    debug_assert!(!slot.evicted, "switch_entry() on an evicted holder");
    state.set_callback(Some(self.as_callback()));
    state.set_cacheable(victim.take_cacheable());
    victim.set_callback(None);
    slot.entry = Some(entry.clone());
  }

  /// Retires this holder if it is free. Any parked object is dropped.
  pub(crate) fn evict_if_free(&self) -> bool {
    let mut slot = self.slot.lock();
    if slot.entry.is_some() || slot.evicted {
      return false;
    }

    self.free_entries.fetch_sub(1, Ordering::AcqRel);
    slot.evicted = true;
    slot.freed = None;
    true
  }

  /// Retires a holder that currently owns an entry. The caller holds the lock
  /// of that entry.
  pub(crate) fn set_evicted(&self) {
    let mut slot = self.slot.lock();
    debug_assert!(slot.entry.is_some(), "set_evicted() on a free holder");
    slot.evicted = true;
    slot.entry = None;
  }

  #[cfg(test)]
  pub(crate) fn is_evicted(&self) -> bool {
    self.slot.lock().evicted
  }
}

impl<C: Cacheable> Callback<C> for Holder<C> {
  fn access(&self) {
    self.recently_used.store(true, Ordering::Relaxed);
  }

  fn free(&self, freed: Option<Arc<C>>) {
    let mut slot = self.slot.lock();
    if slot.evicted || slot.entry.is_none() {
      // Already detached; counting it again would corrupt the free count.
      debug_assert!(false, "free() on a holder that owns no entry");
      return;
    }

    slot.freed = freed;
    slot.entry = None;
    self.recently_used.store(false, Ordering::Relaxed);
    self.free_entries.fetch_add(1, Ordering::AcqRel);
  }
}
