use crate::cacheable::Cacheable;
use crate::daemon::{DaemonService, Serviceable, SubscriptionToken, WorkStatus};
use crate::entry::{CacheEntry, EntryState};
use crate::shared::CacheContext;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use fibre::mpsc;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::warn;

/// Cleans dirty entries and shrinks the clock on a daemon thread, so that
/// user threads looking for a free slot do not have to wait for I/O.
///
/// Work is queued through a bounded channel. When the channel is full,
/// `schedule_clean` returns `false` and the caller cleans the entry itself.
pub(crate) struct BackgroundCleaner<C: Cacheable> {
  cache: Weak<dyn CacheContext<C>>,
  daemon: Arc<dyn DaemonService>,
  token: OnceCell<SubscriptionToken>,
  queue_tx: mpsc::BoundedSender<Arc<CacheEntry<C>>>,
  queue_rx: Mutex<mpsc::BoundedReceiver<Arc<CacheEntry<C>>>>,
  /// Set while a service request is outstanding, so that requests coalesce.
  scheduled: AtomicBool,
  /// Set when someone asked for the clock to be shrunk.
  shrink: AtomicBool,
}

impl<C: Cacheable> BackgroundCleaner<C> {
  /// Creates a cleaner with room for `queue_size` entries and subscribes it to
  /// `daemon` as an on-demand client.
  pub(crate) fn spawn(
    cache: Weak<dyn CacheContext<C>>,
    daemon: Arc<dyn DaemonService>,
    queue_size: usize,
  ) -> Arc<Self> {
    let (queue_tx, queue_rx) = mpsc::bounded(queue_size.max(1));
    let cleaner = Arc::new(Self {
      cache,
      daemon: daemon.clone(),
      token: OnceCell::new(),
      queue_tx,
      queue_rx: Mutex::new(queue_rx),
      scheduled: AtomicBool::new(false),
      shrink: AtomicBool::new(false),
    });

    let token = daemon.subscribe(cleaner.clone(), true);
    let _ = cleaner.token.set(token);
    cleaner
  }

  /// Queues `entry` for cleaning. The caller holds the lock of `entry`.
  ///
  /// Returns `false` if the queue is full or the daemon has stopped. An entry
  /// that is already queued is not queued twice; that counts as success.
  pub(crate) fn schedule_clean(&self, entry: &Arc<CacheEntry<C>>, state: &mut EntryState<C>) -> bool {
    if !self.daemon.is_running() {
      return false;
    }
    if state.is_clean_queued() {
      return true;
    }
    if self.queue_tx.try_send(entry.clone()).is_err() {
      return false;
    }
    state.set_clean_queued(true);
    self.request_service();
    true
  }

  /// Asks for the clock to be shrunk on the daemon thread. Returns `false` if
  /// the daemon has stopped and the caller has to shrink it itself.
  pub(crate) fn schedule_shrink(&self) -> bool {
    if !self.daemon.is_running() {
      return false;
    }
    self.shrink.store(true, Ordering::Release);
    self.request_service();
    true
  }

  /// Wakes up the daemon unless a request is already outstanding.
  fn request_service(&self) {
    if self
      .scheduled
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      if let Some(token) = self.token.get() {
        self.daemon.service_now(*token);
      }
    }
  }

  pub(crate) fn unsubscribe(&self) {
    if let Some(token) = self.token.get() {
      self.daemon.unsubscribe(*token);
    }
  }
}

impl<C: Cacheable> Serviceable for BackgroundCleaner<C> {
  fn perform_work(&self) -> WorkStatus {
    // Clear the flag first so that work queued from now on gets serviced.
    self.scheduled.store(false, Ordering::Release);

    let cache = match self.cache.upgrade() {
      Some(cache) => cache,
      None => return WorkStatus::Done,
    };

    if self.shrink.swap(false, Ordering::AcqRel) {
      cache.shrink();
    }

    // One entry per call so the daemon can service other clients in between.
    let next = self.queue_rx.lock().try_recv().ok();
    if let Some(entry) = next {
      if let Err(err) = cache.clean_entry(&entry) {
        // The entry stays dirty and unpinned; a later sweep will retry.
        warn!(key = ?entry.key(), error = %err, "background clean failed");
      }
      if !self.queue_rx.lock().is_empty() || self.shrink.load(Ordering::Acquire) {
        self.request_service();
      }
    }

    WorkStatus::Done
  }
}
