//! A small worker-service abstraction used to run cache maintenance off the
//! caller's thread, and a thread-backed implementation of it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

/// Identifies a subscription to a [`DaemonService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
  /// Creates a token. Daemon implementations hand out one per subscription.
  pub const fn new(id: u64) -> Self {
    Self(id)
  }

  pub const fn id(&self) -> u64 {
    self.0
  }
}

/// What a [`Serviceable`] wants the daemon to do after a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
  /// Nothing more to do until the next request or tick.
  Done,
  /// Service this client again as soon as possible.
  Requeue,
}

/// A unit of background work that a [`DaemonService`] runs on request.
pub trait Serviceable: Send + Sync {
  fn perform_work(&self) -> WorkStatus;
}

/// A generic periodic/on-demand task runner.
pub trait DaemonService: Send + Sync {
  /// Registers `client`. On-demand clients only run after `service_now`;
  /// the others also run periodically.
  fn subscribe(&self, client: Arc<dyn Serviceable>, on_demand_only: bool) -> SubscriptionToken;

  /// Requests that the client behind `token` runs as soon as possible.
  fn service_now(&self, token: SubscriptionToken);

  /// Removes a client. Unknown tokens are ignored.
  fn unsubscribe(&self, token: SubscriptionToken);

  /// Whether requests made through `service_now` will still be serviced.
  /// Clients fall back to doing their work inline when this is `false`.
  fn is_running(&self) -> bool {
    true
  }
}

struct Client {
  token: SubscriptionToken,
  serviceable: Arc<dyn Serviceable>,
  on_demand_only: bool,
  requested: bool,
}

struct DaemonState {
  clients: Vec<Client>,
}

struct DaemonInner {
  state: Mutex<DaemonState>,
  wakeup: Condvar,
  stop_flag: AtomicBool,
  next_token: AtomicU64,
  tick_interval: Duration,
}

/// A [`DaemonService`] that runs all of its clients on one dedicated thread.
///
/// The thread stops when the daemon is shut down or dropped.
pub struct ThreadDaemon {
  inner: Arc<DaemonInner>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadDaemon {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThreadDaemon")
      .field("tick_interval", &self.inner.tick_interval)
      .field("clients", &self.inner.state.lock().clients.len())
      .finish()
  }
}

impl ThreadDaemon {
  /// The default interval at which periodic clients are serviced.
  pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

  /// Spawns a daemon thread with the default tick interval.
  pub fn spawn(name: impl Into<String>) -> Arc<Self> {
    Self::with_tick_interval(name, Self::DEFAULT_TICK_INTERVAL)
  }

  /// Spawns a daemon thread that services periodic clients every `tick_interval`.
  pub fn with_tick_interval(name: impl Into<String>, tick_interval: Duration) -> Arc<Self> {
    let inner = Arc::new(DaemonInner {
      state: Mutex::new(DaemonState { clients: Vec::new() }),
      wakeup: Condvar::new(),
      stop_flag: AtomicBool::new(false),
      next_token: AtomicU64::new(1),
      tick_interval,
    });

    let name = name.into();
    let thread_inner = inner.clone();
    let handle = match thread::Builder::new()
      .name(name.clone())
      .spawn(move || Self::run(thread_inner))
    {
      Ok(handle) => {
        info!(daemon = %name, ?tick_interval, "daemon started");
        Some(handle)
      }
      Err(err) => {
        warn!(daemon = %name, error = %err, "failed to spawn daemon thread; clients will not be serviced");
        inner.stop_flag.store(true, Ordering::Release);
        None
      }
    };

    Arc::new(Self {
      inner,
      handle: Mutex::new(handle),
    })
  }

  fn run(inner: Arc<DaemonInner>) {
    let mut last_tick = Instant::now();

    while !inner.stop_flag.load(Ordering::Acquire) {
      let periodic_due;
      let work: Vec<(SubscriptionToken, Arc<dyn Serviceable>)> = {
        let mut state = inner.state.lock();
        if !state.clients.iter().any(|c| c.requested) {
          let remaining = inner
            .tick_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
          if !remaining.is_zero() {
            inner.wakeup.wait_for(&mut state, remaining);
          }
        }
        if inner.stop_flag.load(Ordering::Acquire) {
          break;
        }

        periodic_due = last_tick.elapsed() >= inner.tick_interval;
        state
          .clients
          .iter_mut()
          .filter(|c| c.requested || (periodic_due && !c.on_demand_only))
          .map(|c| {
            c.requested = false;
            (c.token, c.serviceable.clone())
          })
          .collect()
      };

      if periodic_due {
        last_tick = Instant::now();
      }

      // Clients run without the daemon lock so they may call back into it.
      for (token, serviceable) in work {
        if serviceable.perform_work() == WorkStatus::Requeue {
          let mut state = inner.state.lock();
          if let Some(client) = state.clients.iter_mut().find(|c| c.token == token) {
            client.requested = true;
          }
        }
      }
    }

    debug!("daemon thread exiting");
  }

  /// Stops the daemon thread and waits for it to exit. Clients are dropped.
  pub fn shutdown(&self) {
    self.inner.stop_flag.store(true, Ordering::Release);
    let clients = {
      let mut state = self.inner.state.lock();
      self.inner.wakeup.notify_all();
      std::mem::take(&mut state.clients)
    };
    // Dropped outside the lock in case a client calls back into the daemon.
    drop(clients);

    if let Some(handle) = self.handle.lock().take() {
      // A client may drop the last reference to the daemon from the daemon
      // thread itself; joining would then wait forever.
      if handle.thread().id() != thread::current().id() {
        let _ = handle.join();
      }
    }
  }
}

impl DaemonService for ThreadDaemon {
  fn subscribe(&self, client: Arc<dyn Serviceable>, on_demand_only: bool) -> SubscriptionToken {
    let token = SubscriptionToken::new(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
    let mut state = self.inner.state.lock();
    state.clients.push(Client {
      token,
      serviceable: client,
      on_demand_only,
      requested: false,
    });
    debug!(?token, on_demand_only, "daemon client subscribed");
    token
  }

  fn service_now(&self, token: SubscriptionToken) {
    let mut state = self.inner.state.lock();
    if let Some(client) = state.clients.iter_mut().find(|c| c.token == token) {
      client.requested = true;
      self.inner.wakeup.notify_one();
    }
  }

  fn unsubscribe(&self, token: SubscriptionToken) {
    let removed = {
      let mut state = self.inner.state.lock();
      let index = state.clients.iter().position(|c| c.token == token);
      index.map(|i| state.clients.remove(i))
    };
    drop(removed);
  }

  fn is_running(&self) -> bool {
    !self.inner.stop_flag.load(Ordering::Acquire)
  }
}

impl Drop for ThreadDaemon {
  fn drop(&mut self) {
    self.shutdown();
  }
}
