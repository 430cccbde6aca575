pub(crate) mod clock;
pub(crate) mod holder;

use crate::cacheable::Cacheable;
use crate::entry::{CacheEntry, EntryState};
use crate::error::CacheError;
use crate::shared::CacheContext;

use std::sync::Arc;

/// The handle a `CacheEntry` keeps to its slot in the replacement policy.
///
/// Both methods are called with the entry lock held.
pub(crate) trait Callback<C: Cacheable>: Send + Sync {
  /// The entry was used. The policy should prefer other victims for a while.
  fn access(&self);

  /// The entry was removed from the cache. `freed` is the object it held, which
  /// the policy may hand to the next entry it places in this slot.
  fn free(&self, freed: Option<Arc<C>>);
}

/// A replacement policy decides which slot a new entry goes into and which
/// entries are evicted to make room for it.
pub(crate) trait ReplacementPolicy<C: Cacheable>: Send + Sync {
  /// Places `entry` into a slot, evicting an old entry if necessary. On return
  /// the entry has its callback set and, if a slot was reused, holds the
  /// object parked in (or taken over from) that slot.
  ///
  /// The caller holds the lock on `entry`; `state` is its guarded state.
  fn insert_entry(
    &self,
    cache: &dyn CacheContext<C>,
    entry: &Arc<CacheEntry<C>>,
    state: &mut EntryState<C>,
  ) -> Result<(), CacheError>;

  /// Tries to bring the number of slots back down to the maximum size.
  fn do_shrink(&self, cache: &dyn CacheContext<C>);

  /// The number of allocated slots.
  fn size(&self) -> usize;
}
