//! The repository: cache-aside reads with a single-flight fetch guarantee.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::{FetchFn, PostProcessFn, RepoConfig, StorageBackend};
use crate::error::{RepoError, Result};
use crate::freshness::{evaluate, StoredRecord};
use crate::normalize::{normalize, FieldMap};
use crate::storage::{FileStorage, MemoryStorage, SqliteStorage, StorageAdapter};

/// Read-only snapshot of the cached record's freshness.
///
/// Produced by [`Repository::get_data_up_to_date_status`]; building it never
/// triggers a fetch and never mutates anything.
#[derive(Debug, Clone, PartialEq)]
pub struct DataStatus<T> {
  /// Whether `get_data` would serve the cache as-is.
  pub is_data_up_to_date: bool,
  /// When the record was last written, if one exists.
  pub last_fetched: Option<DateTime<Utc>>,
  /// Whether the record was explicitly invalidated.
  pub is_invalid: bool,
  /// The cached payload, stale or not.
  pub local_data: Option<T>,
}

/// Before/after record snapshots returned by [`Repository::invalidate_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invalidation {
  pub prev: Option<StoredRecord>,
  pub next: Option<StoredRecord>,
}

/// The shared result every caller joining an in-flight fetch receives.
type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

/// In-flight state of the one fetch a repository may have outstanding.
enum FetchState<T> {
  /// No fetch outstanding.
  Idle,
  /// A fetch is outstanding; join it instead of starting another.
  Fetching(SharedFetch<T>),
}

/// A cache-aside repository for a single named piece of data.
///
/// Fronts a user-supplied async fetch function with a time-bounded cache:
/// callers see either fresh cached data or newly fetched data, and while one
/// fetch is in flight every additional caller joins it instead of firing a
/// redundant one. Cloning is cheap and clones share all state.
pub struct Repository<T> {
  pub(crate) inner: Arc<RepoInner<T>>,
}

impl<T> Clone for Repository<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

pub(crate) struct RepoInner<T> {
  pub(crate) name: String,
  pub(crate) stale_after: chrono::Duration,
  fetch: FetchFn,
  field_map: Option<FieldMap>,
  post_process: Option<PostProcessFn<T>>,
  storage: Box<dyn StorageAdapter>,
  in_flight: Mutex<FetchState<T>>,
  pub(crate) syncer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T> RepoInner<T> {
  pub(crate) fn lock_in_flight(&self) -> MutexGuard<'_, FetchState<T>> {
    // A poisoned lock only means a caller panicked; the state is still valid.
    match self.in_flight.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub(crate) fn lock_syncer(&self) -> MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
    match self.syncer.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl<T> Repository<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Build a repository from its configuration, opening the selected
  /// storage backend.
  pub fn new(config: RepoConfig<T>) -> Result<Self> {
    let storage: Box<dyn StorageAdapter> = match config.backend {
      StorageBackend::Sqlite => Box::new(SqliteStorage::open()?),
      StorageBackend::File => Box::new(FileStorage::open("repo-cache")?),
      StorageBackend::Memory => Box::new(MemoryStorage::new()),
    };

    Self::with_storage(config, storage)
  }

  /// Build a repository on top of a caller-supplied storage adapter.
  pub fn with_storage(config: RepoConfig<T>, storage: Box<dyn StorageAdapter>) -> Result<Self> {
    if config.name.is_empty() {
      return Err(RepoError::Config("a repository name is required".into()));
    }
    let fetch = config
      .fetch
      .ok_or_else(|| RepoError::Config("a fetch function is required".into()))?;

    let stale_after =
      chrono::Duration::from_std(config.stale_after).unwrap_or(chrono::Duration::MAX);

    Ok(Self {
      inner: Arc::new(RepoInner {
        name: config.name,
        stale_after,
        fetch,
        field_map: config.field_map,
        post_process: config.post_process,
        storage,
        in_flight: Mutex::new(FetchState::Idle),
        syncer: Mutex::new(None),
      }),
    })
  }

  /// The repository name, i.e. the storage key of its record.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Serve the cached payload if it is still fresh, otherwise fetch,
  /// normalize, post-process, store, and return the new payload.
  ///
  /// While one fetch is outstanding every additional caller joins it:
  /// exactly one invocation of the fetch function happens and all callers
  /// observe the same settled outcome, success or failure alike.
  pub async fn get_data(&self) -> Result<T> {
    self.join_or_start(false).await
  }

  /// Unconditionally refresh through the single-flight slot: join an
  /// outstanding fetch if there is one, otherwise start a fresh one that
  /// skips the cache check. Used by the background syncer.
  pub(crate) async fn refresh(&self) -> Result<T> {
    self.join_or_start(true).await
  }

  fn join_or_start(&self, force: bool) -> SharedFetch<T> {
    let mut state = self.inner.lock_in_flight();
    match &*state {
      FetchState::Fetching(shared) => {
        debug!(name = %self.inner.name, "joining in-flight fetch");
        shared.clone()
      }
      FetchState::Idle => {
        let shared = Self::start_flight(&self.inner, force);
        *state = FetchState::Fetching(shared.clone());
        // Drive the fetch to completion even if every caller is dropped,
        // otherwise the in-flight slot could wedge shut.
        tokio::spawn(shared.clone());
        shared
      }
    }
  }

  /// Build the shared future for one flight. It clears the in-flight slot
  /// on every exit path before resolving.
  fn start_flight(inner: &Arc<RepoInner<T>>, force: bool) -> SharedFetch<T> {
    let inner = Arc::clone(inner);

    async move {
      let result = if force {
        inner.fetch_fresh().await
      } else {
        inner.fetch_or_cached().await
      };

      *inner.lock_in_flight() = FetchState::Idle;

      result
    }
    .boxed()
    .shared()
  }

  /// Inspect the cached record without ever triggering a fetch.
  pub async fn get_data_up_to_date_status(&self) -> Result<DataStatus<T>> {
    let record = self.inner.storage.get(&self.inner.name).await?;
    let freshness = evaluate(record.as_ref(), self.inner.stale_after, Utc::now());

    let local_data = match freshness.data {
      Some(data) => Some(serde_json::from_value(data)?),
      None => None,
    };

    Ok(DataStatus {
      is_data_up_to_date: freshness.up_to_date,
      last_fetched: freshness.last_fetched,
      is_invalid: freshness.invalid,
      local_data,
    })
  }

  /// Mark the cached record as unusable without deleting it.
  ///
  /// The payload and its timestamp stay in place for inspection; the next
  /// `get_data` goes to the fetch function. Invalidating a repository that
  /// has never fetched does nothing and does not fail.
  pub async fn invalidate_data(&self) -> Result<Invalidation> {
    let prev = self.inner.storage.get(&self.inner.name).await?;
    let next = prev.clone().map(|record| StoredRecord {
      is_invalid: true,
      ..record
    });

    self.inner.storage.set(&self.inner.name, next.as_ref()).await?;
    debug!(name = %self.inner.name, "invalidated record");

    Ok(Invalidation { prev, next })
  }

  /// Delete the cached record, returning the pre-clear snapshot.
  pub async fn clear_data(&self) -> Result<Option<StoredRecord>> {
    let prev = self.inner.storage.get(&self.inner.name).await?;
    self.inner.storage.set(&self.inner.name, None).await?;
    debug!(name = %self.inner.name, "cleared record");

    Ok(prev)
  }
}

impl<T> RepoInner<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Cache-aside read: a fresh record wins, otherwise fetch and store.
  async fn fetch_or_cached(&self) -> Result<T> {
    let record = self.storage.get(&self.name).await?;
    let freshness = evaluate(record.as_ref(), self.stale_after, Utc::now());

    if freshness.up_to_date {
      if let Some(data) = freshness.data {
        debug!(name = %self.name, "serving cached data");
        return Ok(serde_json::from_value(data)?);
      }
    }

    self.fetch_fresh().await
  }

  /// Invoke the fetch function and run the full pipeline: normalize,
  /// post-process, store, return. A failed fetch leaves the stored record
  /// untouched.
  async fn fetch_fresh(&self) -> Result<T> {
    debug!(name = %self.name, "fetching fresh data");

    let raw = (self.fetch)()
      .await
      .map_err(|e| RepoError::Fetch(Arc::from(e)))?;

    let normalized = normalize(raw, self.field_map.as_ref())?;
    let mut data: T = serde_json::from_value(normalized)?;

    if let Some(post_process) = &self.post_process {
      data = post_process(data);
    }

    let record = StoredRecord {
      data: serde_json::to_value(&data)?,
      last_fetched: Utc::now(),
      is_invalid: false,
    };
    self.storage.set(&self.name, Some(&record)).await?;

    Ok(data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::time::Duration;

  /// Repository over in-memory storage whose fetch counts its invocations.
  fn counting_repo(
    stale_after: Duration,
    response: Value,
  ) -> (Repository<Value>, Arc<AtomicUsize>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);

    let repo = Repository::with_storage(
      RepoConfig::new("test")
        .stale_after(stale_after)
        .fetch(move || {
          counter.fetch_add(1, Ordering::SeqCst);
          let response = response.clone();
          async move { Ok::<_, String>(response) }
        }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    (repo, fetches)
  }

  #[tokio::test]
  async fn test_resolves_to_fetched_data() {
    let (repo, _) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    assert_eq!(repo.get_data().await.unwrap(), json!({ "whatever": true }));
  }

  #[tokio::test]
  async fn test_fresh_cache_skips_the_fetch() {
    let (repo, fetches) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    repo.get_data().await.unwrap();
    let data = repo.get_data().await.unwrap();

    assert_eq!(data, json!({ "whatever": true }));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_cache_refetches() {
    let (repo, fetches) = counting_repo(Duration::from_millis(30), json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    repo.get_data().await.unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_zero_stale_after_caches_forever() {
    let (repo, fetches) = counting_repo(Duration::ZERO, json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    repo.get_data().await.unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert!(status.is_data_up_to_date);
  }

  #[tokio::test]
  async fn test_concurrent_callers_share_one_fetch() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);

    let repo: Repository<Value> = Repository::with_storage(
      RepoConfig::new("test")
        .stale_after(Duration::from_secs(60))
        .fetch(move || {
          counter.fetch_add(1, Ordering::SeqCst);
          async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>(json!({ "whatever": true }))
          }
        }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    let (a, b, c, d) = tokio::join!(
      repo.get_data(),
      repo.get_data(),
      repo.get_data(),
      repo.get_data()
    );

    assert_eq!(a.unwrap(), json!({ "whatever": true }));
    assert_eq!(b.unwrap(), json!({ "whatever": true }));
    assert_eq!(c.unwrap(), json!({ "whatever": true }));
    assert_eq!(d.unwrap(), json!({ "whatever": true }));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fetch_failure_reaches_every_waiter_and_clears_the_slot() {
    let failing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&failing);

    let repo: Repository<Value> = Repository::with_storage(
      RepoConfig::new("test")
        .stale_after(Duration::from_secs(60))
        .fetch(move || {
          let failing = flag.load(Ordering::SeqCst);
          async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if failing {
              Err("upstream is down".to_string())
            } else {
              Ok(json!({ "whatever": true }))
            }
          }
        }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    let (a, b) = tokio::join!(repo.get_data(), repo.get_data());
    assert!(matches!(a, Err(RepoError::Fetch(_))));
    assert!(matches!(b, Err(RepoError::Fetch(_))));

    // A failed fetch must not write anything.
    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert_eq!(status.local_data, None);
    assert_eq!(status.last_fetched, None);

    // The slot is cleared; the repository is not wedged into "always busy".
    failing.store(false, Ordering::SeqCst);
    assert_eq!(repo.get_data().await.unwrap(), json!({ "whatever": true }));
  }

  #[tokio::test]
  async fn test_fetch_failure_keeps_previous_record() {
    let failing = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failing);

    let repo: Repository<Value> = Repository::with_storage(
      RepoConfig::new("test")
        .stale_after(Duration::from_millis(30))
        .fetch(move || {
          let failing = flag.load(Ordering::SeqCst);
          async move {
            if failing {
              Err("upstream is down".to_string())
            } else {
              Ok(json!({ "version": 1 }))
            }
          }
        }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    repo.get_data().await.unwrap();
    failing.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(repo.get_data().await.is_err());

    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert_eq!(status.local_data, Some(json!({ "version": 1 })));
    assert!(status.last_fetched.is_some());
  }

  #[tokio::test]
  async fn test_initial_status_is_empty() {
    let (repo, _) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    let status = repo.get_data_up_to_date_status().await.unwrap();

    assert!(!status.is_data_up_to_date);
    assert!(!status.is_invalid);
    assert_eq!(status.last_fetched, None);
    assert_eq!(status.local_data, None);
  }

  #[tokio::test]
  async fn test_status_after_fetch() {
    let (repo, fetches) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    let status = repo.get_data_up_to_date_status().await.unwrap();

    assert!(status.is_data_up_to_date);
    assert!(!status.is_invalid);
    assert_eq!(status.local_data, Some(json!({ "whatever": true })));
    let age = Utc::now() - status.last_fetched.unwrap();
    assert!(age < chrono::Duration::seconds(2));

    // The status check itself never fetches.
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_keeps_data_but_marks_it_stale() {
    let (repo, fetches) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    let invalidation = repo.invalidate_data().await.unwrap();

    let prev = invalidation.prev.unwrap();
    let next = invalidation.next.unwrap();
    assert!(!prev.is_invalid);
    assert!(next.is_invalid);
    assert_eq!(prev.data, next.data);
    assert_eq!(prev.last_fetched, next.last_fetched);

    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert!(!status.is_data_up_to_date);
    assert!(status.is_invalid);
    assert_eq!(status.local_data, Some(json!({ "whatever": true })));

    // The next read goes back to the fetch function.
    repo.get_data().await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_without_a_record_is_a_noop() {
    let (repo, _) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    let invalidation = repo.invalidate_data().await.unwrap();
    assert_eq!(invalidation.prev, None);
    assert_eq!(invalidation.next, None);

    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert!(!status.is_data_up_to_date);
    assert!(!status.is_invalid);
  }

  #[tokio::test]
  async fn test_invalidate_overrides_zero_stale_after() {
    let (repo, fetches) = counting_repo(Duration::ZERO, json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    repo.invalidate_data().await.unwrap();

    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert!(!status.is_data_up_to_date);

    repo.get_data().await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_clear_removes_the_record_and_returns_it() {
    let (repo, fetches) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    repo.get_data().await.unwrap();
    let prev = repo.clear_data().await.unwrap().unwrap();
    assert_eq!(prev.data, json!({ "whatever": true }));

    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert!(!status.is_data_up_to_date);
    assert!(!status.is_invalid);
    assert_eq!(status.last_fetched, None);
    assert_eq!(status.local_data, None);

    repo.get_data().await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_clear_without_a_record_returns_none() {
    let (repo, _) = counting_repo(Duration::from_secs(60), json!({ "whatever": true }));

    assert_eq!(repo.clear_data().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_flat_field_map_through_get_data() {
    let repo: Repository<Value> = Repository::with_storage(
      RepoConfig::new("weather")
        .stale_after(Duration::from_secs(60))
        .field_map(FieldMap::object([("temperature", "t"), ("windspeed", "w")]))
        .fetch(|| async { Ok::<_, String>(json!({ "t": 30, "w": 5, "p": 1024 })) }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    let data = repo.get_data().await.unwrap();
    assert_eq!(data, json!({ "temperature": 30, "windspeed": 5 }));

    // The stored record holds the normalized shape too.
    let status = repo.get_data_up_to_date_status().await.unwrap();
    assert_eq!(
      status.local_data,
      Some(json!({ "temperature": 30, "windspeed": 5 }))
    );
  }

  #[tokio::test]
  async fn test_array_field_map_through_get_data() {
    let repo: Repository<Value> = Repository::with_storage(
      RepoConfig::new("forecast")
        .stale_after(Duration::from_secs(60))
        .field_map(FieldMap::each([
          ("day", "day"),
          ("temperature", "t"),
          ("windspeed", "w"),
        ]))
        .fetch(|| async { Ok::<_, String>(json!([{ "day": "Mon", "t": 20, "w": 3 }])) }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    let data = repo.get_data().await.unwrap();
    assert_eq!(
      data,
      json!([{ "day": "Mon", "temperature": 20, "windspeed": 3 }])
    );
  }

  #[tokio::test]
  async fn test_typed_payload_with_post_process() {
    #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
    struct Weather {
      temperature: i64,
      windspeed: i64,
    }

    let repo: Repository<Weather> = Repository::with_storage(
      RepoConfig::new("weather")
        .stale_after(Duration::from_secs(60))
        .field_map(FieldMap::object([("temperature", "t"), ("windspeed", "w")]))
        .post_process(|mut weather: Weather| {
          // Round wind up to the next full unit.
          weather.windspeed += 1;
          weather
        })
        .fetch(|| async { Ok::<_, String>(json!({ "t": 30, "w": 5, "p": 1024 })) }),
      Box::new(MemoryStorage::new()),
    )
    .unwrap();

    let data = repo.get_data().await.unwrap();
    assert_eq!(
      data,
      Weather {
        temperature: 30,
        windspeed: 6
      }
    );

    // The post-processed value is what got stored.
    let cached = repo.get_data().await.unwrap();
    assert_eq!(cached, data);
  }

  #[tokio::test]
  async fn test_missing_fetch_function_is_a_config_error() {
    let result = Repository::<Value>::with_storage(
      RepoConfig::new("test"),
      Box::new(MemoryStorage::new()),
    );

    assert!(matches!(result, Err(RepoError::Config(_))));
  }

  #[tokio::test]
  async fn test_empty_name_is_a_config_error() {
    let result = Repository::<Value>::with_storage(
      RepoConfig::new("").fetch(|| async { Ok::<_, String>(json!(null)) }),
      Box::new(MemoryStorage::new()),
    );

    assert!(matches!(result, Err(RepoError::Config(_))));
  }

  #[tokio::test]
  async fn test_record_survives_repository_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let fetches = Arc::new(AtomicUsize::new(0));

    let make_repo = |fetches: Arc<AtomicUsize>| {
      Repository::<Value>::with_storage(
        RepoConfig::new("test")
          .stale_after(Duration::from_secs(60))
          .fetch(move || {
            fetches.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(json!({ "whatever": true })) }
          }),
        Box::new(SqliteStorage::open_at(&path).unwrap()),
      )
      .unwrap()
    };

    let repo = make_repo(Arc::clone(&fetches));
    repo.get_data().await.unwrap();
    drop(repo);

    // A new instance over the same database serves the durable record.
    let repo = make_repo(Arc::clone(&fetches));
    assert_eq!(repo.get_data().await.unwrap(), json!({ "whatever": true }));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
  }
}
