//! Repository configuration, normalized once at construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::normalize::FieldMap;

/// Staleness threshold applied when [`RepoConfig::stale_after`] is not set.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(1);

/// Boxed error accepted from fetch functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A future produced by a fetch function, yielding the raw response.
pub type RawFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>;

/// The user-supplied fetch function.
pub type FetchFn = Arc<dyn Fn() -> RawFuture + Send + Sync>;

/// Post-processing hook applied to the payload after normalization.
pub type PostProcessFn<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Which storage backend a repository persists its record to.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Durable storage in a SQLite database (the default).
  #[default]
  Sqlite,
  /// One JSON file per repository under a namespaced data directory.
  File,
  /// A process-local variable; nothing survives the repository instance.
  Memory,
}

/// Configuration for a [`Repository`](crate::Repository).
///
/// Built with [`RepoConfig::new`] plus the chained setters, then handed to
/// `Repository::new`. Every optional setting has an explicit default:
///
/// | setting        | default                    |
/// |----------------|----------------------------|
/// | `stale_after`  | 1 second                   |
/// | `field_map`    | none (identity)            |
/// | `post_process` | none (identity)            |
/// | `backend`      | [`StorageBackend::Sqlite`] |
///
/// A fetch function is required; constructing a repository without one is an
/// error.
pub struct RepoConfig<T> {
  pub(crate) name: String,
  pub(crate) stale_after: Duration,
  pub(crate) fetch: Option<FetchFn>,
  pub(crate) field_map: Option<FieldMap>,
  pub(crate) post_process: Option<PostProcessFn<T>>,
  pub(crate) backend: StorageBackend,
}

impl<T> RepoConfig<T> {
  /// Start a configuration for the repository named `name`.
  ///
  /// The name is the key the single cached entry is stored under.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      stale_after: DEFAULT_STALE_AFTER,
      fetch: None,
      field_map: None,
      post_process: None,
      backend: StorageBackend::default(),
    }
  }

  /// Set how long fetched data stays fresh.
  ///
  /// `Duration::ZERO` means the data never goes stale on its own; only
  /// invalidation or clearing forces a refetch. Sub-second values apply to
  /// the freshness test as given, but the background syncer never ticks
  /// faster than once per second.
  pub fn stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  /// Set the fetch function: an async operation producing the raw response.
  ///
  /// Its failures propagate unmodified to every caller awaiting the fetch.
  pub fn fetch<F, Fut, E>(mut self, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    self.fetch = Some(Arc::new(move || {
      let fut = fetcher();
      Box::pin(async move { fut.await.map_err(Into::into) })
    }));
    self
  }

  /// Set the field-rename table applied to the raw response.
  pub fn field_map(mut self, field_map: FieldMap) -> Self {
    self.field_map = Some(field_map);
    self
  }

  /// Set a hook applied to the payload after normalization, before the
  /// storage write. Must be pure.
  pub fn post_process<F>(mut self, post_process: F) -> Self
  where
    F: Fn(T) -> T + Send + Sync + 'static,
  {
    self.post_process = Some(Arc::new(post_process));
    self
  }

  /// Select the storage backend.
  pub fn backend(mut self, backend: StorageBackend) -> Self {
    self.backend = backend;
    self
  }
}
