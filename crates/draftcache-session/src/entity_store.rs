//! Keyed table of canonical server-fetched entities, one table per kind.
//!
//! The store ensures that each `(kind, id)` maps to exactly one `Arc<Entity>`:
//!
//! - **Replace, never mutate**: hydrate swaps in a fresh `Arc`, so `Arc::ptr_eq`
//!   on two reads means the entity did not change in between
//! - **Order**: ids keep the order in which the server first returned them
//! - **Collections**: entities are tagged with the collection they were loaded for,
//!   so a commit can replace one collection without touching another
//!
//! # Example
//!
//! ```ignore
//! let mut store = EntityStore::new();
//! store.hydrate(EntityKind::Testcase, vec![entity]);
//!
//! let first = store.get(EntityKind::Testcase, &id).unwrap();
//! store.hydrate(EntityKind::Testcase, vec![same_entity_refetched]);
//! let second = store.get(EntityKind::Testcase, &id).unwrap();
//!
//! // Different snapshot objects, even if the data is identical
//! assert!(!Arc::ptr_eq(&first, &second));
//! ```

use draftcache_core::{CollectionId, Entity, EntityId, EntityKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Entities of a single kind.
#[derive(Debug, Clone, Default)]
struct KindTable {
    entities: HashMap<EntityId, Arc<Entity>>,
    /// Server order, first-seen.
    order: Vec<EntityId>,
}

impl KindTable {
    fn upsert(&mut self, entity: Entity) -> bool {
        let id = entity.id().clone();
        let is_new = !self.entities.contains_key(&id);
        if is_new {
            self.order.push(id.clone());
        }
        self.entities.insert(id, Arc::new(entity));
        is_new
    }

    fn remove(&mut self, id: &EntityId) -> Option<Arc<Entity>> {
        let removed = self.entities.remove(id)?;
        self.order.retain(|o| o != id);
        Some(removed)
    }
}

/// Keyed store of canonical entities.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    tables: HashMap<EntityKind, KindTable>,
}

impl EntityStore {
    /// Create a new empty entity store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current snapshot of an entity.
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<Arc<Entity>> {
        self.tables
            .get(&kind)?
            .entities
            .get(id)
            .map(Arc::clone)
    }

    /// Borrow an entity without bumping its reference count.
    pub fn peek(&self, kind: EntityKind, id: &EntityId) -> Option<&Entity> {
        self.tables
            .get(&kind)?
            .entities
            .get(id)
            .map(Arc::as_ref)
    }

    /// Check if an entity with the given id exists.
    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.tables
            .get(&kind)
            .is_some_and(|t| t.entities.contains_key(id))
    }

    /// Upsert entities by id, replacing each one wholesale.
    ///
    /// Returns the number of ids that were not in the store before.
    #[tracing::instrument(level = "debug", skip(self, entities))]
    pub fn hydrate(&mut self, kind: EntityKind, entities: impl IntoIterator<Item = Entity>) -> usize {
        let table = self.tables.entry(kind).or_default();
        let mut inserted = 0;
        let mut total = 0;
        for entity in entities {
            total += 1;
            if table.upsert(entity) {
                inserted += 1;
            }
        }
        tracing::debug!(total = total, inserted = inserted, "Hydrated entities");
        inserted
    }

    /// Make `entities` the exact membership of `collection`, in the given order.
    ///
    /// Entities previously tagged with the collection but absent from `entities`
    /// are dropped. Returns the ids that were dropped.
    #[tracing::instrument(level = "debug", skip(self, entities), fields(collection = %collection))]
    pub fn replace_collection(
        &mut self,
        kind: EntityKind,
        collection: &CollectionId,
        entities: Vec<Entity>,
    ) -> Vec<EntityId> {
        let table = self.tables.entry(kind).or_default();

        let keep: std::collections::HashSet<&EntityId> = entities.iter().map(Entity::id).collect();
        let stale: Vec<EntityId> = table
            .order
            .iter()
            .filter(|id| {
                table
                    .entities
                    .get(*id)
                    .is_some_and(|e| e.collection() == Some(collection))
                    && !keep.contains(id)
            })
            .cloned()
            .collect();
        for id in &stale {
            table.remove(id);
        }

        // Members move to the end in response order so the collection reads in server order.
        for entity in &entities {
            table.order.retain(|o| o != entity.id());
        }
        let count = entities.len();
        for entity in entities {
            let id = entity.id().clone();
            table.order.push(id.clone());
            table.entities.insert(id, Arc::new(entity));
        }

        tracing::debug!(members = count, dropped = stale.len(), "Replaced collection");
        stale
    }

    /// Remove an entity.
    pub fn remove(&mut self, kind: EntityKind, id: &EntityId) -> Option<Arc<Entity>> {
        self.tables.get_mut(&kind)?.remove(id)
    }

    /// Ids of a kind, in server order.
    pub fn ids(&self, kind: EntityKind) -> impl Iterator<Item = &EntityId> {
        self.tables
            .get(&kind)
            .into_iter()
            .flat_map(|t| t.order.iter())
    }

    /// Ids of a kind that belong to `collection`, in server order.
    pub fn ids_in<'a>(
        &'a self,
        kind: EntityKind,
        collection: &'a CollectionId,
    ) -> impl Iterator<Item = &'a EntityId> {
        self.tables.get(&kind).into_iter().flat_map(move |t| {
            t.order.iter().filter(move |id| {
                t.entities
                    .get(*id)
                    .is_some_and(|e| e.collection() == Some(collection))
            })
        })
    }

    /// Number of entities of a kind.
    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.tables.get(&kind).map_or(0, |t| t.entities.len())
    }

    /// Check if the store holds no entities at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| t.entities.is_empty())
    }

    /// Drop every entity of a kind.
    pub fn clear_kind(&mut self, kind: EntityKind) {
        self.tables.remove(&kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tc(id: &str, input: &str, collection: &str) -> Entity {
        let mut fields = draftcache_core::FieldMap::new();
        fields.insert("input".into(), json!(input));
        Entity::new(EntityId::server(id), fields)
            .with_version("rev-1")
            .in_collection(CollectionId::new(collection))
    }

    #[test]
    fn test_hydrate_then_get() {
        let mut store = EntityStore::new();
        let inserted = store.hydrate(EntityKind::Testcase, vec![tc("a", "x", "ts")]);
        assert_eq!(inserted, 1);

        let got = store.get(EntityKind::Testcase, &EntityId::server("a")).unwrap();
        assert_eq!(got.field("input"), Some(&json!("x")));
        assert!(store.get(EntityKind::Span, &EntityId::server("a")).is_none());
    }

    #[test]
    fn test_hydrate_replaces_reference() {
        let mut store = EntityStore::new();
        let id = EntityId::server("a");
        store.hydrate(EntityKind::Testcase, vec![tc("a", "x", "ts")]);
        let first = store.get(EntityKind::Testcase, &id).unwrap();

        store.hydrate(EntityKind::Testcase, vec![tc("a", "x", "ts")]);
        let second = store.get(EntityKind::Testcase, &id).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
        // The old snapshot is untouched.
        assert_eq!(first.field("input"), Some(&json!("x")));
    }

    #[test]
    fn test_reads_without_writes_share_reference() {
        let mut store = EntityStore::new();
        let id = EntityId::server("a");
        store.hydrate(EntityKind::Testcase, vec![tc("a", "x", "ts")]);
        let first = store.get(EntityKind::Testcase, &id).unwrap();
        let second = store.get(EntityKind::Testcase, &id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_order_is_first_seen() {
        let mut store = EntityStore::new();
        store.hydrate(
            EntityKind::Testcase,
            vec![tc("c", "", "ts"), tc("a", "", "ts"), tc("b", "", "ts")],
        );
        store.hydrate(EntityKind::Testcase, vec![tc("a", "changed", "ts")]);

        let ids: Vec<String> = store
            .ids(EntityKind::Testcase)
            .map(ToString::to_string)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_replace_collection_leaves_other_collections() {
        let mut store = EntityStore::new();
        store.hydrate(
            EntityKind::Testcase,
            vec![tc("x1", "", "x"), tc("y1", "", "y"), tc("x2", "", "x")],
        );

        let dropped = store.replace_collection(
            EntityKind::Testcase,
            &CollectionId::new("x"),
            vec![tc("x2", "new", "x"), tc("x3", "", "x")],
        );
        assert_eq!(dropped, vec![EntityId::server("x1")]);

        let x = CollectionId::new("x");
        let in_x: Vec<String> = store
            .ids_in(EntityKind::Testcase, &x)
            .map(ToString::to_string)
            .collect();
        assert_eq!(in_x, vec!["x2", "x3"]);
        assert!(store.contains(EntityKind::Testcase, &EntityId::server("y1")));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = EntityStore::new();
        store.hydrate(EntityKind::Span, vec![tc("s1", "", "trace")]);
        assert_eq!(store.len(EntityKind::Span), 1);

        assert!(store.remove(EntityKind::Span, &EntityId::server("s1")).is_some());
        assert!(store.remove(EntityKind::Span, &EntityId::server("s1")).is_none());

        store.hydrate(EntityKind::Span, vec![tc("s2", "", "trace")]);
        store.clear_kind(EntityKind::Span);
        assert!(store.is_empty());
    }
}
