//! Error type shared by the repository and its storage backends.

use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors produced by a repository or one of its storage backends.
///
/// The type is `Clone` (failure sources are reference-counted) so that a
/// single failed fetch can be delivered to every caller waiting on the same
/// in-flight operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepoError {
  /// The configuration is missing a required setting.
  #[error("invalid configuration: {0}")]
  Config(String),

  /// The user-supplied fetch function failed. The original error is carried
  /// unmodified as the source.
  #[error("fetch failed: {0}")]
  Fetch(#[source] Arc<dyn std::error::Error + Send + Sync>),

  /// A storage backend could not be opened, read, or written.
  #[error("storage error: {0}")]
  Storage(String),

  /// The raw response did not have the shape the field map expects.
  #[error("cannot normalize response: {0}")]
  Normalize(String),

  /// A payload or stored record could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serde(#[source] Arc<serde_json::Error>),
}

impl From<serde_json::Error> for RepoError {
  fn from(err: serde_json::Error) -> Self {
    RepoError::Serde(Arc::new(err))
  }
}
