//! Local, uncommitted patches layered over canonical entities.
//!
//! A draft holds only the fields the user touched. Setting a field merges it
//! shallowly into the patch; nested values are replaced, never merged.

use draftcache_core::{EntityId, EntityKind, FieldMap};
use serde_json::Value;
use std::collections::HashMap;

/// Partial field overrides for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    patch: FieldMap,
}

impl Draft {
    /// Create an empty draft.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_patch(patch: FieldMap) -> Self {
        Self { patch }
    }

    /// The overridden fields.
    pub fn patch(&self) -> &FieldMap {
        &self.patch
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.patch.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.patch.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.patch.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.patch.remove(key)
    }

    /// Keep only the keys for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        self.patch.retain(|k, v| keep(k, v));
    }

    pub fn into_patch(self) -> FieldMap {
        self.patch
    }
}

/// Drafts of every kind, keyed by `(kind, id)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftStore {
    drafts: HashMap<(EntityKind, EntityId), Draft>,
}

impl DraftStore {
    /// Create a new empty draft store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<&Draft> {
        self.drafts.get(&(kind, id.clone()))
    }

    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.drafts.contains_key(&(kind, id.clone()))
    }

    pub fn get_mut(&mut self, kind: EntityKind, id: &EntityId) -> Option<&mut Draft> {
        self.drafts.get_mut(&(kind, id.clone()))
    }

    /// Register an empty draft if none exists.
    pub fn ensure(&mut self, kind: EntityKind, id: &EntityId) -> &mut Draft {
        self.drafts.entry((kind, id.clone())).or_default()
    }

    /// Merge one field into the draft, creating it if absent.
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub fn set_field(&mut self, kind: EntityKind, id: &EntityId, key: &str, value: Value) {
        self.ensure(kind, id).set(key, value);
    }

    /// Remove one field from the draft.
    ///
    /// The draft itself is dropped once it becomes empty.
    pub fn remove_field(&mut self, kind: EntityKind, id: &EntityId, key: &str) -> Option<Value> {
        let map_key = (kind, id.clone());
        let draft = self.drafts.get_mut(&map_key)?;
        let removed = draft.remove(key);
        if draft.is_empty() {
            self.drafts.remove(&map_key);
        }
        removed
    }

    /// Drop the whole draft.
    pub fn remove(&mut self, kind: EntityKind, id: &EntityId) -> Option<Draft> {
        self.drafts.remove(&(kind, id.clone()))
    }

    /// Drop the draft if it no longer overrides anything.
    pub fn prune(&mut self, kind: EntityKind, id: &EntityId) -> bool {
        let map_key = (kind, id.clone());
        if self.drafts.get(&map_key).is_some_and(Draft::is_empty) {
            self.drafts.remove(&map_key);
            return true;
        }
        false
    }

    /// Move a draft to a new id, replacing any draft already there.
    pub fn rekey(&mut self, kind: EntityKind, from: &EntityId, to: EntityId) {
        if let Some(draft) = self.drafts.remove(&(kind, from.clone())) {
            self.drafts.insert((kind, to), draft);
        }
    }

    /// Move a patch key to a new name on one draft. Returns false if the key was absent.
    pub fn rename_key(&mut self, kind: EntityKind, id: &EntityId, from: &str, to: &str) -> bool {
        let Some(draft) = self.drafts.get_mut(&(kind, id.clone())) else {
            return false;
        };
        let Some(value) = draft.remove(from) else {
            return false;
        };
        draft.set(to, value);
        true
    }

    /// Ids with a draft of the given kind, in no particular order.
    pub fn ids(&self, kind: EntityKind) -> impl Iterator<Item = &EntityId> {
        self.drafts
            .keys()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, id)| id)
    }

    /// Total number of drafts across kinds.
    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_field_creates_draft() {
        let mut store = DraftStore::new();
        let id = EntityId::server("tc-1");
        store.set_field(EntityKind::Testcase, &id, "input", json!("hello"));

        let draft = store.get(EntityKind::Testcase, &id).unwrap();
        assert_eq!(draft.get("input"), Some(&json!("hello")));
        assert!(store.get(EntityKind::Revision, &id).is_none());
    }

    #[test]
    fn test_set_field_is_shallow() {
        let mut store = DraftStore::new();
        let id = EntityId::server("tc-1");
        store.set_field(EntityKind::Testcase, &id, "meta", json!({"a": 1, "b": 2}));
        store.set_field(EntityKind::Testcase, &id, "meta", json!({"a": 3}));

        let draft = store.get(EntityKind::Testcase, &id).unwrap();
        assert_eq!(draft.get("meta"), Some(&json!({"a": 3})));
    }

    #[test]
    fn test_remove_last_field_prunes_draft() {
        let mut store = DraftStore::new();
        let id = EntityId::server("tc-1");
        store.set_field(EntityKind::Testcase, &id, "input", json!("x"));
        store.set_field(EntityKind::Testcase, &id, "expected", json!("y"));

        assert_eq!(
            store.remove_field(EntityKind::Testcase, &id, "input"),
            Some(json!("x"))
        );
        assert!(store.contains(EntityKind::Testcase, &id));

        store.remove_field(EntityKind::Testcase, &id, "expected");
        assert!(!store.contains(EntityKind::Testcase, &id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_ensure_keeps_existing_patch() {
        let mut store = DraftStore::new();
        let id = EntityId::server("tc-1");
        store.set_field(EntityKind::Testcase, &id, "input", json!("x"));
        store.ensure(EntityKind::Testcase, &id);
        assert_eq!(store.get(EntityKind::Testcase, &id).unwrap().patch().len(), 1);
    }

    #[test]
    fn test_rekey_moves_draft() {
        let mut store = DraftStore::new();
        let from = EntityId::parse("local:testcase:1");
        store.set_field(EntityKind::Testcase, &from, "input", json!("x"));

        store.rekey(EntityKind::Testcase, &from, EntityId::server("tc-9"));
        assert!(!store.contains(EntityKind::Testcase, &from));
        assert!(store.contains(EntityKind::Testcase, &EntityId::server("tc-9")));
    }

    #[test]
    fn test_prune_only_empty() {
        let mut store = DraftStore::new();
        let id = EntityId::server("tc-1");
        store.ensure(EntityKind::Testcase, &id);
        assert!(store.prune(EntityKind::Testcase, &id));

        store.set_field(EntityKind::Testcase, &id, "input", json!("x"));
        assert!(!store.prune(EntityKind::Testcase, &id));
    }
}
