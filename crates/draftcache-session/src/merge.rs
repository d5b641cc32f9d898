//! Effective values: canonical entity overlaid with its draft.

use crate::columns::ColumnState;
use crate::draft_store::Draft;
use draftcache_core::{Column, Entity, FieldMap};
use serde_json::Value;

/// Shallow overlay of `patch` onto `base`. Patch keys win.
pub fn overlay(base: &FieldMap, patch: &FieldMap) -> FieldMap {
    let mut out = base.clone();
    for (key, value) in patch {
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Patch of a locally created row, with every column filled in.
///
/// Column order comes first, then any patch keys outside the column set.
pub fn defaulted(patch: &FieldMap, columns: &[Column], missing: &Value) -> FieldMap {
    let mut out = FieldMap::new();
    for column in columns {
        let value = patch.get(&column.key).cloned().unwrap_or_else(|| missing.clone());
        out.insert(column.key.clone(), value);
    }
    for (key, value) in patch {
        if !out.contains_key(key) {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Effective fields of one row.
///
/// Server rows overlay the draft onto the entity. Rows with no entity (locally
/// created) are the draft alone, defaulted with `columns`.
pub fn effective(
    entity: Option<&Entity>,
    draft: Option<&Draft>,
    columns: &[Column],
    missing: &Value,
) -> FieldMap {
    let empty = FieldMap::new();
    let patch = draft.map_or(&empty, Draft::patch);
    match entity {
        Some(entity) => overlay(entity.fields(), patch),
        None => defaulted(patch, columns, missing),
    }
}

/// Entity fields as seen through the collection's pending column operations.
///
/// Renamed committed columns appear under their current key and deleted columns are
/// dropped. This is the base drafts are compared against, since draft keys are
/// always current column keys.
pub fn base_fields(entity: &Entity, columns: Option<&ColumnState>) -> FieldMap {
    let Some(columns) = columns.filter(|c| c.has_changes()) else {
        return entity.fields().clone();
    };
    let key_map = columns.key_map();
    let deleted = columns.deleted_keys();

    let mut base = FieldMap::new();
    for (key, value) in entity.fields() {
        if deleted.iter().any(|d| d == key) {
            continue;
        }
        let key = key_map.get(key.as_str()).copied().unwrap_or(key.as_str());
        base.insert(key.to_string(), value.clone());
    }
    base
}

/// Row as it would look under the collection's pending column operations.
///
/// Committed columns are renamed, deleted columns are dropped, and every proposed
/// column is present (filled with `missing` when the row has no value). Draft keys
/// are already in terms of current column keys and win over entity values.
///
/// A renamed column never lands on a non-column entity field: `EditSession`
/// rejects such renames with `AlreadyExists`.
pub fn project_row(
    entity: Option<&Entity>,
    draft: Option<&Draft>,
    columns: &ColumnState,
    missing: &Value,
) -> FieldMap {
    let mut base = entity
        .map(|e| base_fields(e, Some(columns)))
        .unwrap_or_default();
    if let Some(draft) = draft {
        for (key, value) in draft.patch() {
            base.insert(key.clone(), value.clone());
        }
    }

    let mut out = FieldMap::new();
    for column in columns.effective_columns() {
        let value = base.remove(&column.key).unwrap_or_else(|| missing.clone());
        out.insert(column.key, value);
    }
    // Fields outside the column set (ids, metadata) pass through.
    for (key, value) in base {
        out.insert(key, value);
    }
    out
}
