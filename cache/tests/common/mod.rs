#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fibre_pagecache::{
  BoxError, CacheBuilder, Cacheable, DaemonService, PageCache, Serviceable, SubscriptionToken,
  WorkStatus,
};
use parking_lot::Mutex;

/// A fake disk that pages are read from and written back to. It counts what
/// happens to it and can be told to fail.
#[derive(Debug, Default)]
pub struct Disk {
  pages: Mutex<HashMap<u64, u64>>,
  absent: Mutex<HashSet<u64>>,
  constructed: AtomicUsize,
  reads: AtomicUsize,
  cleans: AtomicUsize,
  lost_writes: AtomicUsize,
  fail_reads: AtomicBool,
  fail_cleans: AtomicBool,
  read_delay_ms: AtomicU64,
}

impl Disk {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// A factory for the cache that counts the pages it creates.
  pub fn factory(self: &Arc<Self>) -> impl Fn() -> TestPage + Send + Sync + 'static {
    let disk = self.clone();
    move || {
      disk.constructed.fetch_add(1, Ordering::SeqCst);
      TestPage::new(disk.clone())
    }
  }

  pub fn stored(&self, key: u64) -> Option<u64> {
    self.pages.lock().get(&key).copied()
  }

  pub fn store(&self, key: u64, value: u64) {
    self.pages.lock().insert(key, value);
  }

  /// Makes reads of `key` report that no such page exists.
  pub fn mark_absent(&self, key: u64) {
    self.absent.lock().insert(key);
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  pub fn fail_cleans(&self, fail: bool) {
    self.fail_cleans.store(fail, Ordering::SeqCst);
  }

  pub fn set_read_delay(&self, delay: Duration) {
    self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  pub fn constructed(&self) -> usize {
    self.constructed.load(Ordering::SeqCst)
  }

  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  pub fn cleans(&self) -> usize {
    self.cleans.load(Ordering::SeqCst)
  }

  /// Dirty pages whose identity was cleared without being written back.
  pub fn lost_writes(&self) -> usize {
    self.lost_writes.load(Ordering::SeqCst)
  }
}

#[derive(Debug)]
pub struct TestPage {
  disk: Arc<Disk>,
  identity: Mutex<Option<u64>>,
  value: AtomicU64,
  dirty: AtomicBool,
}

impl TestPage {
  pub fn new(disk: Arc<Disk>) -> Self {
    Self {
      disk,
      identity: Mutex::new(None),
      value: AtomicU64::new(0),
      dirty: AtomicBool::new(false),
    }
  }

  pub fn value(&self) -> u64 {
    self.value.load(Ordering::SeqCst)
  }

  pub fn write(&self, value: u64) {
    self.value.store(value, Ordering::SeqCst);
    self.dirty.store(true, Ordering::SeqCst);
  }
}

impl Cacheable for TestPage {
  type Key = u64;

  fn set_identity(&self, key: &u64) -> Result<bool, BoxError> {
    if self.disk.fail_reads.load(Ordering::SeqCst) {
      return Err("read failed".into());
    }
    let delay = self.disk.read_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      thread::sleep(Duration::from_millis(delay));
    }
    if self.disk.absent.lock().contains(key) {
      return Ok(false);
    }

    self.disk.reads.fetch_add(1, Ordering::SeqCst);
    let value = self.disk.stored(*key).unwrap_or(0);
    self.value.store(value, Ordering::SeqCst);
    self.dirty.store(false, Ordering::SeqCst);
    *self.identity.lock() = Some(*key);
    Ok(true)
  }

  fn create_identity(&self, key: &u64) -> Result<(), BoxError> {
    self.value.store(0, Ordering::SeqCst);
    // A new page has never been written.
    self.dirty.store(true, Ordering::SeqCst);
    *self.identity.lock() = Some(*key);
    Ok(())
  }

  fn clear_identity(&self) {
    if self.dirty.swap(false, Ordering::SeqCst) {
      self.disk.lost_writes.fetch_add(1, Ordering::SeqCst);
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
    if self.disk.fail_cleans.load(Ordering::SeqCst) {
      return Err("write failed".into());
    }
    if let Some(key) = self.identity() {
      self.disk.store(key, self.value());
    }
    self.dirty.store(false, Ordering::SeqCst);
    self.disk.cleans.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

pub fn build_cache(disk: &Arc<Disk>, max_size: usize) -> PageCache<TestPage> {
  CacheBuilder::new()
    .max_size(max_size)
    .shards(4)
    .factory(disk.factory())
    .collect_access_counts(true)
    .build()
    .unwrap()
}

/// Loads and immediately releases each key.
pub fn touch(cache: &PageCache<TestPage>, keys: impl IntoIterator<Item = u64>) {
  for key in keys {
    cache.find(&key).unwrap().unwrap().release();
  }
}

/// Loads `key`, writes `value` into it and releases it.
pub fn dirty(cache: &PageCache<TestPage>, key: u64, value: u64) {
  let page = cache.find(&key).unwrap().unwrap();
  page.write(value);
}

struct ManualClient {
  token: SubscriptionToken,
  client: Arc<dyn Serviceable>,
  requested: bool,
}

/// A daemon service that only runs its clients when told to, so tests can
/// observe the state in between.
#[derive(Default)]
pub struct ManualDaemon {
  clients: Mutex<Vec<ManualClient>>,
  next_token: AtomicU64,
  requests: AtomicUsize,
}

impl ManualDaemon {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn clients(&self) -> usize {
    self.clients.lock().len()
  }

  /// The number of `service_now` calls received so far.
  pub fn requests(&self) -> usize {
    self.requests.load(Ordering::SeqCst)
  }

  pub fn has_pending(&self) -> bool {
    self.clients.lock().iter().any(|c| c.requested)
  }

  /// Runs requested clients until none asks for more work. Returns the number
  /// of units of work performed.
  pub fn run_pending(&self) -> usize {
    let mut runs = 0;
    for _ in 0..10_000 {
      let work: Vec<(SubscriptionToken, Arc<dyn Serviceable>)> = {
        let mut clients = self.clients.lock();
        clients
          .iter_mut()
          .filter(|c| c.requested)
          .map(|c| {
            c.requested = false;
            (c.token, c.client.clone())
          })
          .collect()
      };
      if work.is_empty() {
        break;
      }
      for (token, client) in work {
        runs += 1;
        if client.perform_work() == WorkStatus::Requeue {
          self.service_now(token);
        }
      }
    }
    runs
  }
}

impl DaemonService for ManualDaemon {
  fn subscribe(&self, client: Arc<dyn Serviceable>, _on_demand_only: bool) -> SubscriptionToken {
    let token = SubscriptionToken::new(self.next_token.fetch_add(1, Ordering::SeqCst));
    self.clients.lock().push(ManualClient {
      token,
      client,
      requested: false,
    });
    token
  }

  fn service_now(&self, token: SubscriptionToken) {
    self.requests.fetch_add(1, Ordering::SeqCst);
    if let Some(client) = self.clients.lock().iter_mut().find(|c| c.token == token) {
      client.requested = true;
    }
  }

  fn unsubscribe(&self, token: SubscriptionToken) {
    let removed = {
      let mut clients = self.clients.lock();
      let index = clients.iter().position(|c| c.token == token);
      index.map(|i| clients.remove(i))
    };
    drop(removed);
  }
}
