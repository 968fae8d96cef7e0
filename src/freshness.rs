//! The stored record shape and the freshness decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The one record a repository keeps, as persisted by a storage adapter.
///
/// A record only exists after a successful fetch, so `data` and
/// `last_fetched` are always present together; absence of the whole record
/// is `None` at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
  /// The last successfully fetched, normalized, post-processed payload.
  pub data: Value,
  /// When `data` was written.
  pub last_fetched: DateTime<Utc>,
  /// Set by `invalidate_data`; an invalid record is stale regardless of age.
  #[serde(default)]
  pub is_invalid: bool,
}

/// Result of evaluating a record against the staleness threshold.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Freshness {
  pub up_to_date: bool,
  pub invalid: bool,
  pub data: Option<Value>,
  pub last_fetched: Option<DateTime<Utc>>,
}

/// Decide whether a stored record is still usable.
///
/// Pure function of its inputs; `now` is passed in rather than read here.
/// Rules, in order: no record is stale; an invalidated record is stale but
/// its data is still reported; a `stale_after` of zero is fresh forever;
/// otherwise the record is fresh while its age does not exceed
/// `stale_after`.
pub(crate) fn evaluate(
  record: Option<&StoredRecord>,
  stale_after: Duration,
  now: DateTime<Utc>,
) -> Freshness {
  let Some(record) = record else {
    return Freshness {
      up_to_date: false,
      invalid: false,
      data: None,
      last_fetched: None,
    };
  };

  let data = Some(record.data.clone());
  let last_fetched = Some(record.last_fetched);

  if record.is_invalid {
    return Freshness {
      up_to_date: false,
      invalid: true,
      data,
      last_fetched,
    };
  }

  let up_to_date = stale_after.is_zero() || now - record.last_fetched <= stale_after;

  Freshness {
    up_to_date,
    invalid: false,
    data,
    last_fetched,
  }
}
