//! Field-map normalization of raw responses.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{RepoError, Result};

/// Declarative rename table applied to the raw response before anything else
/// sees it.
///
/// Keys are output field names; values name the source field to read.
/// Source fields not listed are dropped, and listed fields missing from the
/// response are omitted from the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMap {
  /// The raw response is a single flat object.
  Object(BTreeMap<String, String>),
  /// The raw response is an array of objects; the table applies to every
  /// element.
  Each(BTreeMap<String, String>),
}

impl FieldMap {
  /// Rename table for a flat object response.
  pub fn object<I, K, V>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    FieldMap::Object(collect(entries))
  }

  /// Rename table applied to every element of an array response.
  pub fn each<I, K, V>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    FieldMap::Each(collect(entries))
  }

  /// Apply the rename table to the raw response.
  pub(crate) fn apply(&self, raw: &Value) -> Result<Value> {
    match self {
      FieldMap::Object(table) => rename(table, raw),
      FieldMap::Each(table) => {
        let items = raw.as_array().ok_or_else(|| {
          RepoError::Normalize("array field map applied to a non-array response".into())
        })?;

        let items = items
          .iter()
          .map(|item| rename(table, item))
          .collect::<Result<Vec<_>>>()?;

        Ok(Value::Array(items))
      }
    }
  }
}

fn collect<I, K, V>(entries: I) -> BTreeMap<String, String>
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<String>,
{
  entries
    .into_iter()
    .map(|(k, v)| (k.into(), v.into()))
    .collect()
}

/// Build one output object by reading each mapped source field.
fn rename(table: &BTreeMap<String, String>, raw: &Value) -> Result<Value> {
  let src = raw.as_object().ok_or_else(|| {
    RepoError::Normalize("field map applied to a non-object response".into())
  })?;

  let mut out = Map::new();
  for (name, source_field) in table {
    if let Some(value) = src.get(source_field) {
      out.insert(name.clone(), value.clone());
    }
  }

  Ok(Value::Object(out))
}

/// Apply the optional field map; identity when absent.
pub(crate) fn normalize(raw: Value, field_map: Option<&FieldMap>) -> Result<Value> {
  match field_map {
    Some(map) => map.apply(&raw),
    None => Ok(raw),
  }
}
