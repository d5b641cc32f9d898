//! Dirty detection and field-level diffs for drafts.
//!
//! Dirtiness is always computed against the *current* canonical entity, never a
//! snapshot taken at edit time, so a refetch that brings the server up to the draft's
//! values makes the draft clean again.
//!
//! Functions here take the entity's base fields rather than the entity itself. For a
//! row of a collection with pending column operations that base is
//! [`merge::base_fields`](crate::merge::base_fields), so draft keys are compared
//! against the same column they edit.

use crate::draft_store::Draft;
use draftcache_core::{FieldMap, deep_equal, option_equal};
use serde::Serialize;
use serde_json::Value;

/// One changed field between an entity and its draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    /// Value on the entity, `None` if the entity has no such field (or no entity exists).
    pub old_value: Option<Value>,
    pub new_value: Value,
}

/// Check if the draft changes anything relative to the entity's base fields.
///
/// A draft without an entity (a locally created row) is dirty as soon as its
/// patch has any key.
#[tracing::instrument(level = "trace", skip_all)]
pub fn is_dirty(base: Option<&FieldMap>, draft: Option<&Draft>) -> bool {
    let Some(draft) = draft else {
        return false;
    };
    let dirty = match base {
        None => !draft.is_empty(),
        Some(base) => draft
            .patch()
            .iter()
            .any(|(key, value)| !option_equal(base.get(key), Some(value))),
    };
    tracing::trace!(dirty = dirty, "Dirty check result");
    dirty
}

/// List every field whose draft value differs from the entity.
///
/// Fields are reported in patch order.
#[tracing::instrument(level = "debug", skip_all)]
pub fn diff(base: Option<&FieldMap>, draft: Option<&Draft>) -> Vec<FieldChange> {
    let Some(draft) = draft else {
        return Vec::new();
    };
    let changes: Vec<FieldChange> = draft
        .patch()
        .iter()
        .filter_map(|(key, value)| {
            let old = base.and_then(|b| b.get(key));
            if option_equal(old, Some(value)) {
                return None;
            }
            Some(FieldChange {
                field: key.clone(),
                old_value: old.cloned(),
                new_value: value.clone(),
            })
        })
        .collect();
    tracing::debug!(changed = changes.len(), "Computed draft diff");
    changes
}

/// Drop draft keys whose value now equals the base value.
///
/// Returns the number of keys removed.
pub fn prune_unchanged(base: &FieldMap, draft: &mut Draft) -> usize {
    let before = draft.patch().len();
    draft.retain(|key, value| base.get(key).is_none_or(|current| !deep_equal(current, value)));
    before - draft.patch().len()
}
