use crate::cacheable::Cacheable;
use crate::entry::{CacheEntry, EntryState};
use crate::error::CacheError;
use crate::policy::holder::{FreeCount, Holder};
use crate::policy::ReplacementPolicy;
use crate::shared::CacheContext;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// The minimum number of holders to inspect when looking for a victim.
const MIN_ITEMS_TO_CHECK: usize = 20;

/// The share of the clock inspected when looking for a victim.
const MAX_ROTATION: f64 = 0.2;

/// The share of the maximum size inspected by one shrink pass.
const PART_OF_CLOCK_FOR_SHRINK: f64 = 0.1;

/// The clock face: every holder, in sweep order, and the hand.
struct Clock<C: Cacheable> {
  holders: Vec<Arc<Holder<C>>>,
  hand: usize,
}

/// A replacement policy based on the Clock (or Second-Chance) algorithm.
///
/// Holders are arranged in a circular buffer swept by a hand. A holder whose
/// recently-used bit is set gets its bit cleared and is skipped once; an
/// unpinned, clean holder without the bit is reused for the incoming entry.
/// Dirty victims are handed to the background cleaner when there is one, or
/// cleaned inline otherwise.
///
/// The buffer may grow past `max_size` when every candidate is pinned or dirty.
/// Shrink passes bring it back down.
pub(crate) struct ClockPolicy<C: Cacheable> {
  clock: Mutex<Clock<C>>,
  free_entries: FreeCount,
  /// Makes sure only one thread shrinks the clock at a time.
  is_shrinking: AtomicBool,
  max_size: usize,
  /// Whether a holder whose victim was just cleaned inline may be reused by the
  /// same rotation. Off by default: reusing it favours whatever the hand last
  /// touched over a more even spread.
  reuse_cleaned: bool,
}

impl<C: Cacheable> ClockPolicy<C> {
  pub(crate) fn new(initial_size: usize, max_size: usize) -> Self {
    Self {
      clock: Mutex::new(Clock {
        holders: Vec::with_capacity(initial_size.min(max_size)),
        hand: 0,
      }),
      free_entries: Arc::new(CachePadded::new(AtomicUsize::new(0))),
      is_shrinking: AtomicBool::new(false),
      max_size,
      reuse_cleaned: false,
    }
  }

  pub(crate) fn with_reuse_cleaned(mut self, reuse_cleaned: bool) -> Self {
    self.reuse_cleaned = reuse_cleaned;
    self
  }

  /// Appends a new holder for `entry` to the clock.
  fn grow(&self, entry: &Arc<CacheEntry<C>>, state: &mut EntryState<C>) {
    let mut clock = self.clock.lock();
    let holder = Holder::new(entry, state, self.free_entries.clone());
    clock.holders.push(holder);
    debug!(size = clock.holders.len(), max_size = self.max_size, "clock grew");
  }

  /// Returns the holder under the hand and advances the hand.
  fn move_hand(&self) -> Option<Arc<Holder<C>>> {
    let mut clock = self.clock.lock();
    if clock.holders.is_empty() {
      return None;
    }
    if clock.hand >= clock.holders.len() {
      clock.hand = 0;
    }
    let holder = clock.holders[clock.hand].clone();
    clock.hand += 1;
    Some(holder)
  }

  /// Sweeps the clock for a holder that `entry` can take over.
  ///
  /// Free holders are always acceptable. Owned holders are only considered
  /// when `allow_evictions` is set. Returns `Ok(true)` if `entry` now sits in
  /// a holder.
  fn rotate_clock(
    &self,
    cache: &dyn CacheContext<C>,
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
    allow_evictions: bool,
  ) -> Result<bool, CacheError> {
    let mut items_to_check = if allow_evictions {
      let size = self.clock.lock().holders.len();
      MIN_ITEMS_TO_CHECK.max((size as f64 * MAX_ROTATION) as usize)
    } else {
      0
    };

    // A free holder is always acceptable, so keep going while there is one.
    while items_to_check > 0 || self.free_entries.load(Ordering::Acquire) > 0 {
      items_to_check = items_to_check.saturating_sub(1);

      let holder = match self.move_hand() {
        Some(holder) => holder,
        None => return Ok(false),
      };

      let victim = match holder.entry() {
        Some(victim) => victim,
        None => {
          if holder.take_if_free(entry, state) {
            return Ok(true);
          }
          // Someone else took it.
          continue;
        }
      };

      if !allow_evictions || Arc::ptr_eq(&victim, entry) {
        continue;
      }

      let dirty = {
        let mut victim_state = victim.lock();
        if !Self::is_evictable(&victim, &victim_state, &holder, true) {
          continue;
        }
        let item = match victim_state.cacheable() {
          Some(item) => item.clone(),
          None => continue,
        };

        if !item.is_dirty() {
          holder.switch_entry(&mut victim_state, entry, state);
          cache.evict_entry(&victim, &item);
          trace!(victim = ?victim.key(), key = ?entry.key(), "reused clock holder");
          return Ok(true);
        }

        // Let the cleaner write it back and keep looking.
        if let Some(cleaner) = cache.background_cleaner() {
          if cleaner.schedule_clean(&victim, &mut victim_state) {
            continue;
          }
        }

        // No cleaner, or its queue is full. Clean it here, but without
        // holding its lock.
        victim_state.keep(false);
        item
      };

      cache.clean_and_unkeep_entry(&victim, dirty)?;

      if self.reuse_cleaned {
        let mut victim_state = victim.lock();
        if Self::is_evictable(&victim, &victim_state, &holder, false) {
          if let Some(item) = victim_state.cacheable().cloned() {
            if !item.is_dirty() {
              holder.switch_entry(&mut victim_state, entry, state);
              cache.evict_entry(&victim, &item);
              return Ok(true);
            }
          }
        }
      }
    }

    Ok(false)
  }

  /// Checks whether the entry in a holder can be evicted. The caller holds the
  /// lock of `entry`.
  ///
  /// With `clear_recently_used`, a set recently-used bit is cleared and the
  /// entry is given a second chance.
  fn is_evictable(
    entry: &Arc<CacheEntry<C>>,
    state: &EntryState<C>,
    holder: &Holder<C>,
    clear_recently_used: bool,
  ) -> bool {
    // The holder may have been given to another entry while we were waiting
    // for the lock.
    if !holder.is_owned_by(entry) {
      return false;
    }
    if state.is_kept() || !state.is_valid() {
      return false;
    }
    if clear_recently_used && holder.clear_recently_used() {
      return false;
    }
    true
  }

  fn shrink_me(&self, cache: &dyn CacheContext<C>) {
    let mut max_looks = 1usize.max((self.max_size as f64 * PART_OF_CLOCK_FOR_SHRINK) as usize);
    let mut pos = self.clock.lock().hand;
    let mut evicted = 0usize;

    while max_looks > 0 {
      max_looks -= 1;

      let (holder, size) = {
        let clock = self.clock.lock();
        let size = clock.holders.len();
        if size == 0 {
          break;
        }
        if pos >= size {
          pos = 0;
        }
        (clock.holders[pos].clone(), size)
      };
      let index = pos;
      pos += 1;

      if size <= self.max_size {
        break;
      }

      let entry = match holder.entry() {
        Some(entry) => entry,
        None => {
          if holder.evict_if_free() {
            self.remove_holder(index, &holder);
            evicted += 1;
            // The next holder moved into this position.
            pos = index;
          }
          continue;
        }
      };

      let mut state = entry.lock();
      // The recently-used bit is ignored: shrinking must make progress.
      if !Self::is_evictable(&entry, &state, &holder, false) {
        continue;
      }
      let item = match state.cacheable() {
        Some(item) => item.clone(),
        None => continue,
      };
      // Never drop a dirty object without a controlled clean.
      if item.is_dirty() {
        continue;
      }

      holder.set_evicted();
      cache.evict_entry(&entry, &item);
      state.set_cacheable(None);
      state.set_callback(None);
      drop(state);

      self.remove_holder(index, &holder);
      evicted += 1;
      pos = index;
    }

    if evicted > 0 {
      debug!(evicted, size = self.size(), max_size = self.max_size, "clock shrunk");
    }
  }

  fn remove_holder(&self, index: usize, holder: &Arc<Holder<C>>) {
    let mut clock = self.clock.lock();
    // Only the shrinking thread removes holders and other threads only append,
    // so `index` is still correct. Check anyway before touching the clock.
    let index = if clock
      .holders
      .get(index)
      .map_or(false, |h| Arc::ptr_eq(h, holder))
    {
      index
    } else {
      match clock.holders.iter().position(|h| Arc::ptr_eq(h, holder)) {
        Some(found) => found,
        None => {
          debug_assert!(false, "evicted holder is not on the clock");
          return;
        }
      }
    };

    clock.holders.remove(index);
    if index < clock.hand {
      clock.hand -= 1;
    }
  }
}

impl<C: Cacheable> ReplacementPolicy<C> for ClockPolicy<C> {
  fn insert_entry(
    &self,
    cache: &dyn CacheContext<C>,
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
  ) -> Result<(), CacheError> {
    let size = {
      let mut clock = self.clock.lock();
      let size = clock.holders.len();
      if size < self.max_size && self.free_entries.load(Ordering::Acquire) == 0 {
        // There is room and nothing to reuse; no need to look for a victim.
        let holder = Holder::new(entry, state, self.free_entries.clone());
        clock.holders.push(holder);
        return Ok(());
      }
      size
    };

    if size > self.max_size {
      let delegated = cache
        .background_cleaner()
        .map_or(false, |cleaner| cleaner.schedule_shrink());
      if !delegated {
        self.do_shrink(cache);
      }
    }

    // Only evict when the clock is full; below the maximum we would rather
    // grow than throw away valid data.
    if !self.rotate_clock(cache, entry, state, size >= self.max_size)? {
      self.grow(entry, state);
    }
    Ok(())
  }

  fn do_shrink(&self, cache: &dyn CacheContext<C>) {
    if self
      .is_shrinking
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      self.shrink_me(cache);
      self.is_shrinking.store(false, Ordering::Release);
    }
  }

  fn size(&self) -> usize {
    self.clock.lock().holders.len()
  }
}
