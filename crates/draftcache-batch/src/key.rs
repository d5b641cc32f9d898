//! Request keys for deduplication.
//!
//! Two requests are the same request when their canonical JSON forms match: object
//! keys are sorted recursively and arrays are treated as sets, so `{"ids": [2, 1]}`
//! and `{"ids": [1, 2, 2]}` share one key.

use draftcache_core::{ArrayOrder, Error, Result, canonical_key};
use serde::Serialize;

/// Canonical string key of any serializable request.
pub fn serialize_key<T: Serialize + ?Sized>(item: &T) -> Result<String> {
    let value = serde_json::to_value(item).map_err(Error::from)?;
    Ok(canonical_key(&value, ArrayOrder::Normalize))
}
