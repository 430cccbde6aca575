use crate::cacheable::Cacheable;
use crate::entry::CacheEntry;

use core::fmt;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// A helper function to hash a key using a `BuildHasher`.
#[inline]
fn hash_key<K: Hash, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

type Shard<C, H> = RwLock<HashMap<<C as Cacheable>::Key, Arc<CacheEntry<C>>, H>>;

/// The identity map of the cache, partitioned into independently locked shards.
///
/// Shard locks are leaf locks: they are held only for the duration of a single
/// map operation and nothing else is locked while holding one. Entry locks
/// may be held when calling into the store.
pub(crate) struct ShardedStore<C: Cacheable, H> {
  shards: Box<[CachePadded<Shard<C, H>>]>,
  hasher: H,
}

impl<C: Cacheable, H> fmt::Debug for ShardedStore<C, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShardedStore")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<C, H> ShardedStore<C, H>
where
  C: Cacheable,
  H: BuildHasher + Clone,
{
  /// Creates a new `ShardedStore` with the specified number of shards and hasher.
  pub(crate) fn new(num_shards: usize, initial_capacity: usize, hasher: H) -> Self {
    let per_shard = initial_capacity / num_shards.max(1);
    let mut shards = Vec::with_capacity(num_shards);
    for _ in 0..num_shards {
      let shard_map = HashMap::with_capacity_and_hasher(per_shard, hasher.clone());
      shards.push(CachePadded::new(RwLock::new(shard_map)));
    }

    Self {
      shards: shards.into_boxed_slice(),
      hasher,
    }
  }

  #[inline]
  fn shard(&self, key: &C::Key) -> &Shard<C, H> {
    let hash = hash_key(&self.hasher, key);
    // Safe because the builder rejects a shard count of zero.
    let index = hash as usize % self.shards.len();
    &self.shards[index]
  }

  pub(crate) fn get(&self, key: &C::Key) -> Option<Arc<CacheEntry<C>>> {
    self.shard(key).read().get(key).cloned()
  }

  /// Inserts `entry` unless the key is already mapped, in which case the
  /// existing entry is returned.
  pub(crate) fn insert_if_absent(
    &self,
    entry: &Arc<CacheEntry<C>>,
  ) -> Result<(), Arc<CacheEntry<C>>> {
    let key = entry.key();
    let mut guard = self.shard(key).write();
    match guard.entry(key.clone()) {
      Entry::Occupied(occupied) => Err(occupied.get().clone()),
      Entry::Vacant(vacant) => {
        vacant.insert(entry.clone());
        Ok(())
      }
    }
  }

  /// Removes the mapping for the key of `entry`, but only if it still points
  /// at that very entry.
  pub(crate) fn remove_if_same(&self, entry: &Arc<CacheEntry<C>>) -> bool {
    let key = entry.key();
    let mut guard = self.shard(key).write();
    match guard.get(key) {
      Some(mapped) if Arc::ptr_eq(mapped, entry) => {
        guard.remove(key);
        true
      }
      _ => false,
    }
  }

  /// The number of mapped keys. Not a consistent snapshot under concurrent
  /// modification.
  pub(crate) fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.read().len()).sum()
  }

  /// A snapshot of all entries, taken one shard at a time.
  pub(crate) fn entries(&self) -> Vec<Arc<CacheEntry<C>>> {
    let mut entries = Vec::new();
    for shard in self.shards.iter() {
      entries.extend(shard.read().values().cloned());
    }
    entries
  }
}
