mod common;

use common::{build_cache, dirty, touch, Disk};
use fibre_pagecache::{CacheError, Cacheable};
use std::sync::Arc;

#[test]
fn test_find_reads_once_then_hits() {
  let disk = Disk::new();
  disk.store(7, 70);
  let cache = build_cache(&disk, 10);

  let page = cache.find(&7).unwrap().expect("page 7 should exist");
  assert_eq!(*page.key(), 7);
  assert_eq!(page.value(), 70);
  page.release();

  let again = cache.find(&7).unwrap().unwrap();
  assert_eq!(again.value(), 70);
  drop(again);

  assert_eq!(disk.reads(), 1, "The second lookup must be served from the cache");
  let metrics = cache.metrics();
  assert_eq!(metrics.hits, 1);
  assert_eq!(metrics.misses, 1);
  assert_eq!(metrics.used_entries, 1);
  assert_eq!(metrics.allocated_entries, 1);
}

#[test]
fn test_find_absent_page_returns_none_and_recycles_the_object() {
  let disk = Disk::new();
  disk.mark_absent(1);
  let cache = build_cache(&disk, 10);

  assert!(cache.find(&1).unwrap().is_none());
  assert!(!cache.contains(&1));
  assert_eq!(cache.used_entries(), 0);
  assert_eq!(disk.constructed(), 1);

  // The object parked by the failed lookup is reused for the next page.
  touch(&cache, [2]);
  assert_eq!(disk.constructed(), 1);
  assert_eq!(cache.allocated_entries(), 1);
}

#[test]
fn test_failed_read_is_reported_and_not_cached() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);

  disk.fail_reads(true);
  let err = cache.find(&3).unwrap_err();
  assert!(matches!(err, CacheError::Storage { .. }));
  assert!(!cache.contains(&3));

  disk.fail_reads(false);
  let page = cache.find(&3).unwrap().unwrap();
  assert_eq!(page.value(), 0);
}

#[test]
fn test_find_cached_never_loads() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);

  assert!(cache.find_cached(&5).unwrap().is_none());
  assert_eq!(disk.reads(), 0);

  touch(&cache, [5]);
  let page = cache.find_cached(&5).unwrap().unwrap();
  assert_eq!(*page.key(), 5);
  assert_eq!(cache.metrics().misses, 2);
}

#[test]
fn test_create_rejects_existing_keys() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);

  let created = cache.create(&9).unwrap();
  assert!(created.is_dirty(), "A created page has not been written yet");
  drop(created);

  let err = cache.create(&9).unwrap_err();
  assert!(matches!(err, CacheError::ObjectExists { .. }));
  assert_eq!(disk.reads(), 0);
}

#[test]
fn test_remove_writes_back_and_forgets() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  dirty(&cache, 4, 44);

  assert!(cache.remove(&4).unwrap());
  assert_eq!(disk.stored(4), Some(44));
  assert!(!cache.contains(&4));
  assert!(!cache.remove(&4).unwrap(), "Removing an absent key is not an error");
  assert_eq!(disk.lost_writes(), 0);
}

#[test]
fn test_remove_of_kept_page_is_contention() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  let page = cache.find(&1).unwrap().unwrap();

  let err = cache.remove(&1).unwrap_err();
  assert!(err.is_contention());
  assert!(cache.contains(&1));

  page.release();
  assert!(cache.remove(&1).unwrap());
}

#[test]
fn test_pinned_remove_requires_the_only_keep() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  let first = cache.find(&2).unwrap().unwrap();
  let second = cache.find(&2).unwrap().unwrap();
  first.write(22);

  let err = first.remove().unwrap_err();
  assert!(err.is_contention());
  assert!(cache.contains(&2));

  second.remove().unwrap();
  assert!(!cache.contains(&2));
  assert_eq!(disk.stored(2), Some(22));
}

#[test]
fn test_clean_all_and_clean_matching() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  for key in 0..4 {
    dirty(&cache, key, key + 100);
  }

  cache.clean_matching(|key| key % 2 == 0).unwrap();
  assert_eq!(disk.stored(0), Some(100));
  assert_eq!(disk.stored(2), Some(102));
  assert_eq!(disk.stored(1), None);
  assert_eq!(disk.cleans(), 2);

  cache.clean_all().unwrap();
  assert_eq!(disk.stored(1), Some(101));
  assert_eq!(disk.stored(3), Some(103));
  assert_eq!(disk.cleans(), 4);
  assert!(cache.values().iter().all(|page| !page.is_dirty()));
}

#[test]
fn test_clean_failure_propagates_and_keeps_page_dirty() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  dirty(&cache, 1, 11);

  disk.fail_cleans(true);
  let err = cache.clean_all().unwrap_err();
  assert!(matches!(err, CacheError::Storage { .. }));

  let page = cache.find_cached(&1).unwrap().unwrap();
  assert!(page.is_dirty());
  page.release();
  assert!(cache.remove(&1).is_err(), "A page that cannot be written back stays cached");

  disk.fail_cleans(false);
  assert!(cache.remove(&1).unwrap());
  assert_eq!(disk.lost_writes(), 0);
}

#[test]
fn test_age_out_keeps_dirty_and_kept_pages() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  touch(&cache, [0, 1]);
  dirty(&cache, 2, 2);
  let kept = cache.find(&3).unwrap().unwrap();

  cache.age_out();

  assert!(!cache.contains(&0));
  assert!(!cache.contains(&1));
  assert!(cache.contains(&2));
  assert!(cache.contains(&3));
  assert_eq!(cache.used_entries(), 2);
  assert_eq!(cache.allocated_entries(), 4, "Aged out slots stay allocated for reuse");
  drop(kept);
}

#[test]
fn test_discard_drops_without_writing() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  dirty(&cache, 10, 1);
  dirty(&cache, 11, 1);
  let kept = cache.find(&12).unwrap().unwrap();

  assert!(!cache.discard(|key| *key >= 10), "Page 12 is kept");
  assert!(!cache.contains(&10));
  assert!(!cache.contains(&11));
  assert!(cache.contains(&12));
  assert_eq!(disk.cleans(), 0);

  drop(kept);
  assert!(cache.discard(|key| *key == 12));
  assert_eq!(cache.used_entries(), 0);
}

#[test]
fn test_values_lists_cached_objects() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  touch(&cache, [1, 2, 3]);

  let mut keys: Vec<u64> = cache.values().iter().filter_map(|page| page.identity()).collect();
  keys.sort_unstable();
  assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn test_pinned_object_outlives_handle() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  let page = cache.find(&8).unwrap().unwrap();
  let object = page.object();
  drop(page);

  let again = cache.find(&8).unwrap().unwrap();
  assert!(Arc::ptr_eq(&object, &again.object()));
}

#[test]
fn test_shutdown_writes_back_and_refuses_lookups() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  dirty(&cache, 1, 5);
  touch(&cache, [2]);

  cache.shutdown().unwrap();

  assert_eq!(disk.stored(1), Some(5));
  assert_eq!(cache.used_entries(), 0);
  assert!(matches!(cache.find(&1), Err(CacheError::ShutDown { .. })));
  assert!(matches!(cache.find_cached(&1), Err(CacheError::ShutDown { .. })));
  assert!(matches!(cache.create(&3), Err(CacheError::ShutDown { .. })));
}

#[test]
fn test_access_counts_can_be_toggled() {
  let disk = Disk::new();
  let cache = build_cache(&disk, 10);
  cache.set_collect_access_counts(false);
  assert!(!cache.collect_access_counts());

  touch(&cache, [1, 1, 1]);
  assert_eq!(cache.metrics().hits, 0);
  assert_eq!(cache.metrics().misses, 0);

  cache.set_collect_access_counts(true);
  touch(&cache, [1]);
  assert_eq!(cache.metrics().hits, 1);
  assert_eq!(cache.metrics().hit_ratio, 1.0);
}
