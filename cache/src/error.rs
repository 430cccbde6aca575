use std::fmt;

/// A boxed error produced by a `Cacheable` while talking to storage.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache was configured with a maximum size of zero.
  ZeroCapacity,
  /// The cache was configured with zero shards, which is not allowed.
  ZeroShards,
  /// The clean queue of the background cleaner was configured with a size of zero.
  ZeroCleanQueue,
  /// The initial size is larger than the maximum size.
  InitialSizeTooLarge { initial: usize, max: usize },
  /// No `CacheableFactory` was provided, so the cache cannot create objects.
  FactoryRequired,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::ZeroCapacity => write!(f, "page cache maximum size cannot be zero"),
      BuildError::ZeroShards => write!(f, "shard count cannot be zero"),
      BuildError::ZeroCleanQueue => write!(f, "background clean queue size cannot be zero"),
      BuildError::InitialSizeTooLarge { initial, max } => write!(
        f,
        "initial size {} is larger than the maximum size {}",
        initial, max
      ),
      BuildError::FactoryRequired => write!(f, "a cacheable factory is required"),
    }
  }
}

impl std::error::Error for BuildError {}

/// Errors returned by operations on a running cache.
///
/// Keys are carried in their `Debug` form so the error type does not depend on
/// the key type of the cache that produced it.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The entry is pinned by another caller and cannot be removed right now.
  /// This is a retryable condition.
  #[error("entry {key} is kept by another caller")]
  Contention { key: String },

  /// `create()` was called for a key that is already present.
  #[error("object {key} already exists in cache '{cache}'")]
  ObjectExists { cache: String, key: String },

  /// The cache has been shut down and no longer hands out entries.
  #[error("cache '{cache}' has been shut down")]
  ShutDown { cache: String },

  /// The cached object failed to read from or write to storage.
  #[error("storage failure for {key}")]
  Storage {
    key: String,
    #[source]
    source: BoxError,
  },
}

impl CacheError {
  pub(crate) fn contention<K: fmt::Debug>(key: &K) -> Self {
    CacheError::Contention {
      key: format!("{:?}", key),
    }
  }

  pub(crate) fn storage<K: fmt::Debug>(key: &K, source: BoxError) -> Self {
    CacheError::Storage {
      key: format!("{:?}", key),
      source,
    }
  }

  /// Returns `true` if the operation can simply be retried later.
  pub fn is_contention(&self) -> bool {
    matches!(self, CacheError::Contention { .. })
  }
}
