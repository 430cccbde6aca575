//! The contract between the cache and the objects it stores.

use crate::error::BoxError;

use std::fmt;
use std::hash::Hash;

/// An object that can live in a [`PageCache`](crate::PageCache).
///
/// Instances are recycled: when a slot is reused, the cache clears the old
/// identity and assigns a new one to the same instance instead of allocating.
/// All methods take `&self`, because the cache cleans objects without holding
/// the lock of their entry. Implementations synchronize their own state.
pub trait Cacheable: Send + Sync + 'static {
  /// The identity (for example a page number) the object is cached under.
  type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

  /// Makes this instance represent the object identified by `key`, usually by
  /// reading it from storage.
  ///
  /// Returns `Ok(false)` if no such object exists; the cache then forgets the
  /// key and `find` returns `None`.
  fn set_identity(&self, key: &Self::Key) -> Result<bool, BoxError>;

  /// Makes this instance represent a brand new object identified by `key`.
  fn create_identity(&self, key: &Self::Key) -> Result<(), BoxError>;

  /// Forgets the current identity. Called before an instance is parked for
  /// reuse or handed to another key.
  fn clear_identity(&self);

  /// The identity currently held by this instance, if any.
  fn identity(&self) -> Option<Self::Key>;

  /// Whether the in-memory state has diverged from the persisted state.
  fn is_dirty(&self) -> bool;

  /// Writes the object back to storage. `for_remove` is `true` when the object
  /// is being removed from the cache right after this call.
  ///
  /// May block on I/O. On failure the object must stay dirty.
  fn clean(&self, for_remove: bool) -> Result<(), BoxError>;
}

/// Creates fresh, identity-less [`Cacheable`] instances when the cache needs
/// to allocate a new slot.
pub trait CacheableFactory<C>: Send + Sync {
  fn new_cacheable(&self) -> C;
}

impl<C, F> CacheableFactory<C> for F
where
  F: Fn() -> C + Send + Sync,
{
  fn new_cacheable(&self) -> C {
    self()
  }
}
