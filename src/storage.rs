//! Storage adapters: where the single cached record lives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{RepoError, Result};
use crate::freshness::StoredRecord;

/// Asynchronous key-value persistence for [`StoredRecord`]s.
///
/// `set(key, None)` removes the record. The repository always reads and
/// writes the record as a whole; implementations never see partial fields.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
  /// Read the record stored under `key`, if any.
  async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

  /// Write (or, with `None`, remove) the record stored under `key`.
  async fn set(&self, key: &str, record: Option<&StoredRecord>) -> Result<()>;
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Keeps records in a plain process-local variable.
///
/// Nothing survives the repository instance. Convenient for tests and for
/// data that should not outlive the process.
#[derive(Default)]
pub struct MemoryStorage {
  records: Mutex<HashMap<String, StoredRecord>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
  async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
    let records = lock(&self.records)?;
    Ok(records.get(key).cloned())
  }

  async fn set(&self, key: &str, record: Option<&StoredRecord>) -> Result<()> {
    let mut records = lock(&self.records)?;
    match record {
      Some(record) => {
        records.insert(key.to_string(), record.clone());
      }
      None => {
        records.remove(key);
      }
    }
    Ok(())
  }
}

// ============================================================================
// File storage
// ============================================================================

/// Stores each record as one JSON file under a namespaced directory.
///
/// The namespace keeps repositories from different applications apart, the
/// way sandboxed extension storage namespaces its keys.
pub struct FileStorage {
  dir: PathBuf,
}

impl FileStorage {
  /// Storage under the platform data directory, namespaced by `namespace`.
  pub fn open(namespace: &str) -> Result<Self> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| RepoError::Storage("could not determine data directory".into()))?;

    Self::open_at(data_dir.join(namespace))
  }

  /// Storage rooted at an explicit directory.
  pub fn open_at(dir: impl Into<PathBuf>) -> Result<Self> {
    let dir = dir.into();
    std::fs::create_dir_all(&dir)
      .map_err(|e| RepoError::Storage(format!("failed to create storage directory: {e}")))?;

    Ok(Self { dir })
  }

  fn path_for(&self, key: &str) -> PathBuf {
    // Keys are repository names; keep the file name tame regardless.
    let safe: String = key
      .chars()
      .map(|c| {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
          c
        } else {
          '_'
        }
      })
      .collect();

    self.dir.join(format!("{safe}.json"))
  }
}

#[async_trait]
impl StorageAdapter for FileStorage {
  async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
    let path = self.path_for(key);

    let contents = match tokio::fs::read(&path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(RepoError::Storage(format!(
          "failed to read {}: {}",
          path.display(),
          e
        )))
      }
    };

    Ok(Some(serde_json::from_slice(&contents)?))
  }

  async fn set(&self, key: &str, record: Option<&StoredRecord>) -> Result<()> {
    let path = self.path_for(key);

    match record {
      Some(record) => {
        let contents = serde_json::to_vec(record)?;
        tokio::fs::write(&path, contents).await.map_err(|e| {
          RepoError::Storage(format!("failed to write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "stored record");
      }
      None => match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
          return Err(RepoError::Storage(format!(
            "failed to remove {}: {}",
            path.display(),
            e
          )))
        }
      },
    }

    Ok(())
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// Durable storage in a SQLite database, one row per repository name.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for the record table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repo_cache (
    name TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
"#;

impl SqliteStorage {
  /// Open (or create) the database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| RepoError::Storage(format!("failed to create cache directory: {e}")))?;
    }

    Self::open_at(&path)
  }

  /// Open (or create) the database at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path).map_err(|e| {
      RepoError::Storage(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| RepoError::Storage("could not determine data directory".into()))?;

    Ok(data_dir.join("repo-cache").join("cache.db"))
  }

  /// Run database migrations for the record table.
  fn run_migrations(&self) -> Result<()> {
    let conn = lock(&self.conn)?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| RepoError::Storage(format!("failed to run cache migrations: {e}")))?;

    Ok(())
  }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
  async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
    let conn = lock(&self.conn)?;

    let mut stmt = conn
      .prepare("SELECT record FROM repo_cache WHERE name = ?")
      .map_err(|e| RepoError::Storage(format!("failed to prepare query: {e}")))?;

    let row: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();

    match row {
      Some(json) => Ok(Some(serde_json::from_str(&json)?)),
      None => Ok(None),
    }
  }

  async fn set(&self, key: &str, record: Option<&StoredRecord>) -> Result<()> {
    let conn = lock(&self.conn)?;

    match record {
      Some(record) => {
        let json = serde_json::to_string(record)?;
        conn
          .execute(
            "INSERT OR REPLACE INTO repo_cache (name, record) VALUES (?, ?)",
            params![key, json],
          )
          .map_err(|e| RepoError::Storage(format!("failed to store record: {e}")))?;
        debug!(name = key, "stored record");
      }
      None => {
        conn
          .execute("DELETE FROM repo_cache WHERE name = ?", params![key])
          .map_err(|e| RepoError::Storage(format!("failed to delete record: {e}")))?;
      }
    }

    Ok(())
  }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex
    .lock()
    .map_err(|e| RepoError::Storage(format!("lock poisoned: {e}")))
}
