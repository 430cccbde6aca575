//! Fixtures for exercising the replacement policy without a full cache.

use crate::cacheable::Cacheable;
use crate::entry::{CacheEntry, EntryGuard};
use crate::error::{BoxError, CacheError};
use crate::shared::CacheContext;
use crate::task::cleaner::BackgroundCleaner;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct TestStats {
  cleans: AtomicUsize,
  lost_writes: AtomicUsize,
}

impl TestStats {
  pub(crate) fn cleans(&self) -> usize {
    self.cleans.load(Ordering::SeqCst)
  }

  /// Dirty pages whose identity was cleared without a clean.
  pub(crate) fn lost_writes(&self) -> usize {
    self.lost_writes.load(Ordering::SeqCst)
  }
}

#[derive(Debug)]
pub(crate) struct TestPage {
  identity: Mutex<Option<u64>>,
  value: AtomicU64,
  dirty: AtomicBool,
  stats: Arc<TestStats>,
}

impl TestPage {
  pub(crate) fn new(stats: Arc<TestStats>) -> Self {
    Self {
      identity: Mutex::new(None),
      value: AtomicU64::new(0),
      dirty: AtomicBool::new(false),
      stats,
    }
  }

  pub(crate) fn write(&self, value: u64) {
    self.value.store(value, Ordering::SeqCst);
    self.dirty.store(true, Ordering::SeqCst);
  }
}

impl Cacheable for TestPage {
  type Key = u64;

  fn set_identity(&self, key: &u64) -> Result<bool, BoxError> {
    *self.identity.lock() = Some(*key);
    Ok(true)
  }

  fn create_identity(&self, key: &u64) -> Result<(), BoxError> {
    *self.identity.lock() = Some(*key);
    Ok(())
  }

  fn clear_identity(&self) {
    if self.dirty.swap(false, Ordering::SeqCst) {
      self.stats.lost_writes.fetch_add(1, Ordering::SeqCst);
    }
    *self.identity.lock() = None;
  }

  fn identity(&self) -> Option<u64> {
    *self.identity.lock()
  }

  fn is_dirty(&self) -> bool {
    self.dirty.load(Ordering::SeqCst)
  }

  fn clean(&self, _for_remove: bool) -> Result<(), BoxError> {
    self.dirty.store(false, Ordering::SeqCst);
    self.stats.cleans.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

/// A stand-in for the cache that records evictions.
#[derive(Debug, Default)]
pub(crate) struct TestContext {
  stats: Arc<TestStats>,
  evicted: Mutex<Vec<u64>>,
}

impl TestContext {
  pub(crate) fn fresh_entry(&self, key: u64) -> Arc<CacheEntry<TestPage>> {
    Arc::new(CacheEntry::new(key))
  }

  /// Does what the cache does after the policy has found a slot: gives the
  /// entry an object with its identity set and keeps it.
  pub(crate) fn install(&self, entry: &Arc<CacheEntry<TestPage>>, state: &mut EntryGuard<'_, TestPage>) {
    let item = match state.cacheable() {
      Some(item) => item.clone(),
      None => Arc::new(TestPage::new(self.stats.clone())),
    };
    let _ = item.set_identity(entry.key());
    state.set_cacheable(Some(item));
    state.keep(true);
    entry.setting_identity_complete(state);
  }

  pub(crate) fn unkeep(&self, entry: &Arc<CacheEntry<TestPage>>) {
    entry.lock().unkeep();
  }

  pub(crate) fn remove(&self, entry: &Arc<CacheEntry<TestPage>>) {
    let mut state = entry.lock();
    if let Some(item) = state.cacheable() {
      item.clear_identity();
    }
    state.free();
  }

  pub(crate) fn evictions(&self) -> usize {
    self.evicted.lock().len()
  }

  pub(crate) fn evicted_keys(&self) -> Vec<u64> {
    self.evicted.lock().clone()
  }

  pub(crate) fn stats(&self) -> Arc<TestStats> {
    self.stats.clone()
  }
}

impl CacheContext<TestPage> for TestContext {
  fn evict_entry(&self, entry: &Arc<CacheEntry<TestPage>>, item: &Arc<TestPage>) {
    self.evicted.lock().push(*entry.key());
    item.clear_identity();
  }

  fn background_cleaner(&self) -> Option<Arc<BackgroundCleaner<TestPage>>> {
    None
  }

  fn clean_entry(&self, entry: &Arc<CacheEntry<TestPage>>) -> Result<(), CacheError> {
    let item = {
      let mut state = entry.lock();
      match state.cacheable().cloned() {
        Some(item) => {
          state.keep(false);
          item
        }
        None => return Ok(()),
      }
    };
    self.clean_and_unkeep_entry(entry, item)
  }

  fn clean_and_unkeep_entry(&self, entry: &Arc<CacheEntry<TestPage>>, item: Arc<TestPage>) -> Result<(), CacheError> {
    let result = if item.is_dirty() {
      item.clean(false).map_err(|err| CacheError::storage(entry.key(), err))
    } else {
      Ok(())
    };
    entry.lock().unkeep();
    result
  }

  fn shrink(&self) {}
}
