//! Ledger of locally created and locally deleted entities.
//!
//! The ledger tracks structural changes that drafts cannot express:
//! - Rows created locally, which have no canonical entity yet
//! - Rows marked for deletion, which stay in the entity store until commit
//!
//! # Example
//!
//! ```ignore
//! let mut ledger = Ledger::new();
//! let id = ledger.allocate(EntityKind::Testcase, Some(collection));
//!
//! ledger.mark_deleted(EntityKind::Testcase, &server_id);
//! let visible = ledger.visible(EntityKind::Testcase, store.ids(EntityKind::Testcase));
//! ```

use draftcache_core::{CollectionId, EntityId, EntityKind, LocalId};
use std::collections::{HashMap, HashSet};

/// A row created locally, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NewEntry {
    id: EntityId,
    collection: Option<CollectionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct KindLedger {
    /// Creation order.
    new_ids: Vec<NewEntry>,
    deleted_ids: HashSet<EntityId>,
    /// Deletion order, for stable payloads.
    deleted_order: Vec<EntityId>,
}

/// What `mark_deleted` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// A locally created row was discarded outright.
    DiscardedNew,
    /// A server row was marked for deletion.
    Marked,
    /// The id was already marked.
    AlreadyDeleted,
}

/// Count of pending structural changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub new: usize,
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending structural changes.
    pub fn total(&self) -> usize {
        self.new + self.deleted
    }

    /// Check if there are no pending structural changes.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Local creations and deletions, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    kinds: HashMap<EntityKind, KindLedger>,
    /// Local id sequence. Never reused within a session.
    next_seq: u64,
}

impl Ledger {
    /// Create a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh local id and record it as new.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn allocate(&mut self, kind: EntityKind, collection: Option<CollectionId>) -> EntityId {
        self.next_seq += 1;
        let id = EntityId::Local(LocalId::new(kind, self.next_seq));
        self.kinds.entry(kind).or_default().new_ids.push(NewEntry {
            id: id.clone(),
            collection,
        });
        tracing::debug!(id = %id, "Allocated local id");
        id
    }

    /// Check if the id was created locally and is still pending.
    pub fn is_new(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.kinds
            .get(&kind)
            .is_some_and(|k| k.new_ids.iter().any(|e| &e.id == id))
    }

    pub fn is_deleted(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.kinds
            .get(&kind)
            .is_some_and(|k| k.deleted_ids.contains(id))
    }

    /// Collection a locally created id was created in.
    pub fn new_collection(&self, kind: EntityKind, id: &EntityId) -> Option<&CollectionId> {
        self.kinds
            .get(&kind)?
            .new_ids
            .iter()
            .find(|e| &e.id == id)?
            .collection
            .as_ref()
    }

    /// Mark an id as deleted.
    ///
    /// Locally created ids are discarded rather than marked, since the server has
    /// never seen them.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn mark_deleted(&mut self, kind: EntityKind, id: &EntityId) -> Deletion {
        let ledger = self.kinds.entry(kind).or_default();
        if let Some(pos) = ledger.new_ids.iter().position(|e| &e.id == id) {
            ledger.new_ids.remove(pos);
            tracing::debug!("Discarded locally created row");
            return Deletion::DiscardedNew;
        }
        if !ledger.deleted_ids.insert(id.clone()) {
            return Deletion::AlreadyDeleted;
        }
        ledger.deleted_order.push(id.clone());
        Deletion::Marked
    }

    /// Remove a deletion mark. Returns false if the id was not marked.
    pub fn undo_delete(&mut self, kind: EntityKind, id: &EntityId) -> bool {
        let Some(ledger) = self.kinds.get_mut(&kind) else {
            return false;
        };
        if !ledger.deleted_ids.remove(id) {
            return false;
        }
        ledger.deleted_order.retain(|d| d != id);
        true
    }

    /// Locally created ids of a kind, in creation order.
    pub fn new_ids(&self, kind: EntityKind) -> impl Iterator<Item = &EntityId> {
        self.kinds
            .get(&kind)
            .into_iter()
            .flat_map(|k| k.new_ids.iter().map(|e| &e.id))
    }

    /// Locally created ids of a kind that were created in `collection`.
    pub fn new_ids_in<'a>(
        &'a self,
        kind: EntityKind,
        collection: &'a CollectionId,
    ) -> impl Iterator<Item = &'a EntityId> {
        self.kinds.get(&kind).into_iter().flat_map(move |k| {
            k.new_ids
                .iter()
                .filter(move |e| e.collection.as_ref() == Some(collection))
                .map(|e| &e.id)
        })
    }

    /// Ids marked deleted, in deletion order.
    pub fn deleted_ids(&self, kind: EntityKind) -> impl Iterator<Item = &EntityId> {
        self.kinds
            .get(&kind)
            .into_iter()
            .flat_map(|k| k.deleted_order.iter())
    }

    /// Server order minus deletions, followed by locally created ids.
    pub fn visible<'a>(
        &self,
        kind: EntityKind,
        server_ids: impl IntoIterator<Item = &'a EntityId>,
    ) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = server_ids
            .into_iter()
            .filter(|id| !self.is_deleted(kind, id))
            .cloned()
            .collect();
        out.extend(self.new_ids(kind).cloned());
        out
    }

    /// Like [`Ledger::visible`], limited to new ids created in `collection`.
    pub fn visible_in<'a>(
        &self,
        kind: EntityKind,
        collection: &CollectionId,
        server_ids: impl IntoIterator<Item = &'a EntityId>,
    ) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = server_ids
            .into_iter()
            .filter(|id| !self.is_deleted(kind, id))
            .cloned()
            .collect();
        out.extend(self.new_ids_in(kind, collection).cloned());
        out
    }

    /// Forget every listed id, whether new or deleted.
    ///
    /// Used after a commit persisted exactly these ids. Ids not in `ids` are untouched.
    pub fn clear_ids(&mut self, kind: EntityKind, ids: &HashSet<EntityId>) {
        let Some(ledger) = self.kinds.get_mut(&kind) else {
            return;
        };
        ledger.new_ids.retain(|e| !ids.contains(&e.id));
        ledger.deleted_ids.retain(|id| !ids.contains(id));
        ledger.deleted_order.retain(|id| !ids.contains(id));
    }

    /// Pending counts for a kind.
    pub fn pending_counts(&self, kind: EntityKind) -> PendingCounts {
        self.kinds.get(&kind).map_or_else(PendingCounts::default, |k| PendingCounts {
            new: k.new_ids.len(),
            deleted: k.deleted_ids.len(),
        })
    }

    /// Check if nothing is pending for any kind.
    pub fn is_empty(&self) -> bool {
        self.kinds
            .values()
            .all(|k| k.new_ids.is_empty() && k.deleted_ids.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> CollectionId {
        CollectionId::new("ts-1")
    }

    #[test]
    fn test_allocate_is_unique_and_local() {
        let mut ledger = Ledger::new();
        let a = ledger.allocate(EntityKind::Testcase, Some(ts()));
        let b = ledger.allocate(EntityKind::Testcase, Some(ts()));
        let c = ledger.allocate(EntityKind::Span, None);

        assert_ne!(a, b);
        assert!(a.is_local() && b.is_local() && c.is_local());
        assert!(ledger.is_new(EntityKind::Testcase, &a));
        assert!(!ledger.is_new(EntityKind::Testcase, &c));
        assert_eq!(ledger.pending_counts(EntityKind::Testcase).new, 2);
    }

    #[test]
    fn test_delete_new_discards() {
        let mut ledger = Ledger::new();
        let id = ledger.allocate(EntityKind::Testcase, Some(ts()));

        assert_eq!(
            ledger.mark_deleted(EntityKind::Testcase, &id),
            Deletion::DiscardedNew
        );
        assert!(!ledger.is_new(EntityKind::Testcase, &id));
        assert!(!ledger.is_deleted(EntityKind::Testcase, &id));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_delete_and_undo() {
        let mut ledger = Ledger::new();
        let id = EntityId::server("tc-1");

        assert_eq!(ledger.mark_deleted(EntityKind::Testcase, &id), Deletion::Marked);
        assert_eq!(
            ledger.mark_deleted(EntityKind::Testcase, &id),
            Deletion::AlreadyDeleted
        );
        assert_eq!(ledger.pending_counts(EntityKind::Testcase).deleted, 1);

        assert!(ledger.undo_delete(EntityKind::Testcase, &id));
        assert!(!ledger.undo_delete(EntityKind::Testcase, &id));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_visible_order() {
        let mut ledger = Ledger::new();
        let server = [
            EntityId::server("a"),
            EntityId::server("b"),
            EntityId::server("c"),
        ];
        ledger.mark_deleted(EntityKind::Testcase, &server[1]);
        let new = ledger.allocate(EntityKind::Testcase, Some(ts()));

        let visible = ledger.visible(EntityKind::Testcase, server.iter());
        assert_eq!(
            visible,
            vec![server[0].clone(), server[2].clone(), new.clone()]
        );

        let other = CollectionId::new("ts-2");
        let visible = ledger.visible_in(EntityKind::Testcase, &other, server.iter());
        assert_eq!(visible, vec![server[0].clone(), server[2].clone()]);
    }

    #[test]
    fn test_clear_ids_is_scoped() {
        let mut ledger = Ledger::new();
        let keep = ledger.allocate(EntityKind::Testcase, Some(ts()));
        let drop = ledger.allocate(EntityKind::Testcase, Some(ts()));
        ledger.mark_deleted(EntityKind::Testcase, &EntityId::server("x"));
        ledger.mark_deleted(EntityKind::Testcase, &EntityId::server("y"));

        let ids: HashSet<EntityId> = [drop.clone(), EntityId::server("x")].into_iter().collect();
        ledger.clear_ids(EntityKind::Testcase, &ids);

        assert!(ledger.is_new(EntityKind::Testcase, &keep));
        assert!(!ledger.is_new(EntityKind::Testcase, &drop));
        let deleted: Vec<&EntityId> = ledger.deleted_ids(EntityKind::Testcase).collect();
        assert_eq!(deleted, vec![&EntityId::server("y")]);
    }

    #[test]
    fn test_new_ids_in_collection() {
        let mut ledger = Ledger::new();
        let a = ledger.allocate(EntityKind::Testcase, Some(ts()));
        ledger.allocate(EntityKind::Testcase, Some(CollectionId::new("ts-2")));

        let collection = ts();
        let in_ts: Vec<&EntityId> = ledger.new_ids_in(EntityKind::Testcase, &collection).collect();
        assert_eq!(in_ts, vec![&a]);
        assert_eq!(ledger.new_collection(EntityKind::Testcase, &a), Some(&collection));
    }
}
