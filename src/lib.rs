//! Cache-aside repositories for remote data.
//!
//! A [`Repository`] fronts an async fetch function with a time-bounded,
//! durable cache. Reads serve the cache while the record is fresh and go to
//! the source only once it is stale; concurrent reads against a stale record
//! share one fetch. An optional background syncer keeps the record fresh on
//! its own schedule.
//!
//! ```no_run
//! use std::time::Duration;
//! use repo_cache::{FieldMap, RepoConfig, Repository, StorageBackend};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> repo_cache::Result<()> {
//! let repo: Repository<Value> = Repository::new(
//!   RepoConfig::new("weather")
//!     .stale_after(Duration::from_secs(300))
//!     .backend(StorageBackend::Sqlite)
//!     .field_map(FieldMap::object([("temperature", "t"), ("windspeed", "w")]))
//!     .fetch(|| async { Ok::<_, String>(json!({ "t": 30, "w": 5 })) }),
//! )?;
//!
//! let weather = repo.get_data().await?;
//! repo.init_syncer().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod freshness;
mod normalize;
mod repo;
mod storage;
mod syncer;

pub use config::{RepoConfig, StorageBackend, DEFAULT_STALE_AFTER};
pub use error::{RepoError, Result};
pub use freshness::StoredRecord;
pub use normalize::FieldMap;
pub use repo::{DataStatus, Invalidation, Repository};
pub use storage::{FileStorage, MemoryStorage, SqliteStorage, StorageAdapter};
pub use syncer::MIN_SYNC_PERIOD;
