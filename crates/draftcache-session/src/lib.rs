//! Edit session for draftcache.
//!
//! `draftcache-session` is the **editing layer**. It keeps server-fetched entities,
//! local drafts, locally created and deleted rows, and pending column operations, and
//! turns them into a single whole-collection commit.
//!
//! # Role In The Architecture
//!
//! - **Entity store**: one canonical `Arc<Entity>` per `(kind, id)`, replaced on refetch.
//! - **Drafts**: partial patches over entities, pruned when they no longer change anything.
//! - **Ledger**: local creations and deletions awaiting commit.
//! - **Columns**: pending add/rename/delete per collection.
//! - **Commit**: snapshot, validate, send full target state, clear exactly what was sent.
//!
//! # Design Philosophy
//!
//! - **Synchronous stores**: every store operation is plain data in, data out.
//! - **Short critical sections**: state sits behind one mutex that is never held
//!   across an `.await`, so edits are accepted while a commit is in flight.
//! - **Cancel-correct**: async operations use `Cx` + `Outcome` via asupersync.
//!
//! # Example
//!
//! ```ignore
//! let session = EditSession::new(backend);
//! unwrap(session.load_collection(&cx, EntityKind::Testcase, &testset).await);
//!
//! session.set_draft_field(EntityKind::Testcase, &id, "input", json!("hello"));
//! let row = session.create_new_in(EntityKind::Testcase, &testset);
//! session.mark_deleted(EntityKind::Testcase, &old);
//!
//! let version = session.commit(&cx, EntityKind::Testcase, &testset, None).await;
//! ```

pub mod change_tracker;
pub mod columns;
pub mod commit;
pub mod draft_store;
pub mod entity_store;
pub mod ledger;
pub mod merge;

pub use change_tracker::{FieldChange, diff, is_dirty, prune_unchanged};
pub use columns::{ColumnChanges, ColumnState, PendingRename};
pub use commit::{ChangeSummary, CommitPlan, PlannedRow, RowChange};
pub use draft_store::{Draft, DraftStore};
pub use entity_store::EntityStore;
pub use ledger::{Deletion, Ledger, PendingCounts};

use asupersync::{Cx, Outcome};
use draftcache_core::{
    Backend, CollectionId, Column, CommitResponse, Entity, EntityId, EntityKind, Error,
    FetchPage, FetchRequest, FieldMap, Result, deep_equal,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` from a before-hook aborts the operation.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired after the snapshot is taken, before validation and send.
    BeforeCommit,
    /// Fired after a commit has been applied locally.
    AfterCommit,
}

/// Change notifications for UI subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Hydrated {
        kind: EntityKind,
        count: usize,
    },
    DraftChanged {
        kind: EntityKind,
        id: EntityId,
    },
    Created {
        kind: EntityKind,
        id: EntityId,
    },
    Deleted {
        kind: EntityKind,
        id: EntityId,
    },
    Restored {
        kind: EntityKind,
        id: EntityId,
    },
    ColumnsChanged {
        collection: CollectionId,
    },
    Committed {
        kind: EntityKind,
        collection: CollectionId,
        version: String,
    },
    CommitFailed {
        kind: EntityKind,
        collection: CollectionId,
    },
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Handle returned by [`EditSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Listeners {
    next: u64,
    entries: Vec<(SubscriptionId, Listener)>,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Drop a draft key when it is set back to the entity's value.
    pub prune_equal_values: bool,
    /// Value for columns a locally created row has not filled in.
    pub missing_field_default: Value,
    /// Keep edits made while a commit was in flight.
    ///
    /// When false, a successful commit drops every draft it captured, even if it was
    /// edited again before the response arrived.
    pub keep_edits_during_commit: bool,
    /// Page size requested by `load_collection`; `None` lets the backend decide.
    pub page_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prune_equal_values: true,
            missing_field_default: Value::String(String::new()),
            keep_edits_during_commit: true,
            page_size: Some(100),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Stamp of a load, compared against the collection's generation when it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    kind: EntityKind,
    collection: CollectionId,
    generation: u64,
}

impl LoadTicket {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }
}

/// Result of applying loaded pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied { records: usize },
    /// The collection was invalidated, reloaded, or committed since the load began.
    Stale,
}

/// Commit state of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Saving,
}

#[derive(Debug, Default)]
struct CollectionMeta {
    version: Option<String>,
    generation: u64,
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Default)]
struct SessionState {
    entities: EntityStore,
    drafts: DraftStore,
    ledger: Ledger,
    columns: HashMap<CollectionId, ColumnState>,
    collections: HashMap<(EntityKind, CollectionId), CollectionMeta>,
    required: HashMap<EntityKind, Vec<String>>,
    in_flight: HashSet<(EntityKind, CollectionId)>,
}

impl SessionState {
    fn columns_mut(&mut self, collection: &CollectionId) -> &mut ColumnState {
        self.columns
            .entry(collection.clone())
            .or_insert_with(|| ColumnState::new(collection.clone(), Vec::new()))
    }

    fn column_list(&self, collection: Option<&CollectionId>) -> Vec<Column> {
        collection
            .and_then(|c| self.columns.get(c))
            .map(ColumnState::effective_columns)
            .unwrap_or_default()
    }

    fn meta_mut(&mut self, kind: EntityKind, collection: &CollectionId) -> &mut CollectionMeta {
        self.collections
            .entry((kind, collection.clone()))
            .or_default()
    }

    fn plan(&self, kind: EntityKind, collection: &CollectionId, missing: &Value) -> CommitPlan {
        let columns = self
            .columns
            .get(collection)
            .cloned()
            .unwrap_or_else(|| ColumnState::new(collection.clone(), Vec::new()));
        let version = self
            .collections
            .get(&(kind, collection.clone()))
            .and_then(|m| m.version.clone());
        CommitPlan::build(
            kind,
            collection,
            version,
            &self.entities,
            &self.drafts,
            &self.ledger,
            &columns,
            missing,
        )
    }

    fn is_known(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.entities.contains(kind, id)
            || self.drafts.contains(kind, id)
            || self.ledger.is_new(kind, id)
    }

    /// Visible ids of a collection.
    fn collection_ids(&self, kind: EntityKind, collection: &CollectionId) -> Vec<EntityId> {
        self.ledger
            .visible_in(kind, collection, self.entities.ids_in(kind, collection))
    }

    /// Every id of a collection that may carry a draft, including rows marked deleted.
    fn draft_ids(&self, kind: EntityKind, collection: &CollectionId) -> Vec<EntityId> {
        self.entities
            .ids_in(kind, collection)
            .chain(self.ledger.new_ids_in(kind, collection))
            .filter(|id| self.drafts.contains(kind, id))
            .cloned()
            .collect()
    }

    /// Entity fields a draft of `id` is compared against.
    fn base(&self, kind: EntityKind, id: &EntityId) -> Option<FieldMap> {
        let entity = self.entities.peek(kind, id)?;
        let columns = entity.collection().and_then(|c| self.columns.get(c));
        Some(merge::base_fields(entity, columns))
    }

    /// Check if a column key would collide with a non-column field of some row.
    fn shadows_field(&self, collection: &CollectionId, key: &str) -> bool {
        let committed = self
            .columns
            .get(collection)
            .is_some_and(|c| c.committed().iter().any(|col| col.key == key));
        !committed
            && EntityKind::ALL.iter().any(|kind| {
                self.entities
                    .ids_in(*kind, collection)
                    .filter_map(|id| self.entities.peek(*kind, id))
                    .any(|e| e.fields().contains_key(key))
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight flag however the commit ends, including cancellation.
struct InFlightGuard<'a> {
    state: &'a Mutex<SessionState>,
    key: (EntityKind, CollectionId),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).in_flight.remove(&self.key);
    }
}

// ============================================================================
// Edit Session
// ============================================================================

/// Entity cache with drafts and commit, over a [`Backend`].
///
/// All methods take `&self`; share the session behind an `Arc` to edit while a
/// commit is in flight.
pub struct EditSession<B: Backend> {
    backend: B,
    config: SessionConfig,
    state: Mutex<SessionState>,
    listeners: Mutex<Listeners>,
    event_callbacks: Mutex<SessionEventCallbacks>,
}

impl<B: Backend> EditSession<B> {
    /// Create a new session with default configuration.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(backend: B, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(SessionState::default()),
            listeners: Mutex::new(Listeners::default()),
            event_callbacks: Mutex::new(SessionEventCallbacks::default()),
        }
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a callback to run before commit.
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        lock(&self.event_callbacks).before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        lock(&self.event_callbacks).after_commit.push(Box::new(f));
    }

    fn fire(&self, event: SessionEvent) -> Result<()> {
        lock(&self.event_callbacks).fire(event)
    }

    /// Receive every [`StoreEvent`] emitted after this call.
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) -> SubscriptionId {
        let mut listeners = lock(&self.listeners);
        listeners.next += 1;
        let id = SubscriptionId(listeners.next);
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    /// Stop delivering events to a subscriber. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(sid, _)| *sid != id);
        listeners.entries.len() != before
    }

    fn emit(&self, event: StoreEvent) {
        // Listeners run without any lock held so they may call back into the session.
        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    // ========================================================================
    // Entity Store & Merge View
    // ========================================================================

    /// Current canonical snapshot of an entity.
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<Arc<Entity>> {
        lock(&self.state).entities.get(kind, id)
    }

    /// Upsert entities by id. Each entity replaces its predecessor wholesale.
    #[tracing::instrument(level = "debug", skip(self, entities))]
    pub fn hydrate(&self, kind: EntityKind, entities: Vec<Entity>) -> usize {
        let count = entities.len();
        let inserted = lock(&self.state).entities.hydrate(kind, entities);
        self.emit(StoreEvent::Hydrated { kind, count });
        inserted
    }

    /// Upsert one fetched page into a collection.
    ///
    /// Unlike [`EditSession::load_collection`], members missing from the page are kept.
    #[tracing::instrument(level = "debug", skip(self, page), fields(collection = %collection))]
    pub fn hydrate_collection(&self, kind: EntityKind, collection: &CollectionId, page: FetchPage) -> usize {
        let count = page.records.len();
        {
            let mut state = lock(&self.state);
            let version = page.server_version.clone();
            let entities = page
                .records
                .into_iter()
                .map(|r| Entity::from_record(r, version.clone(), Some(collection.clone())));
            state.entities.hydrate(kind, entities);
            if version.is_some() {
                state.meta_mut(kind, collection).version = version;
            }
            if let Some(columns) = page.columns {
                state.columns_mut(collection).set_committed(columns);
            }
        }
        self.emit(StoreEvent::Hydrated { kind, count });
        count
    }

    /// Effective fields of an entity: canonical fields overlaid with its draft.
    ///
    /// Returns `NotFound` for ids marked deleted and for ids with no entity, no draft,
    /// and no pending creation.
    pub fn effective(&self, kind: EntityKind, id: &EntityId) -> Result<FieldMap> {
        let state = lock(&self.state);
        if state.ledger.is_deleted(kind, id) || !state.is_known(kind, id) {
            return Err(Error::entity_not_found(kind, id.clone()));
        }
        let columns = state.column_list(state.ledger.new_collection(kind, id));
        Ok(merge::effective(
            state.entities.peek(kind, id),
            state.drafts.get(kind, id),
            &columns,
            &self.config.missing_field_default,
        ))
    }

    /// Effective fields under the collection's pending column operations.
    pub fn effective_row(
        &self,
        kind: EntityKind,
        collection: &CollectionId,
        id: &EntityId,
    ) -> Result<FieldMap> {
        let state = lock(&self.state);
        if state.ledger.is_deleted(kind, id) || !state.is_known(kind, id) {
            return Err(Error::entity_not_found(kind, id.clone()));
        }
        let empty;
        let columns = match state.columns.get(collection) {
            Some(c) => c,
            None => {
                empty = ColumnState::new(collection.clone(), Vec::new());
                &empty
            }
        };
        Ok(merge::project_row(
            state.entities.peek(kind, id),
            state.drafts.get(kind, id),
            columns,
            &self.config.missing_field_default,
        ))
    }

    /// Server version the collection was last loaded or committed at.
    pub fn version(&self, kind: EntityKind, collection: &CollectionId) -> Option<String> {
        lock(&self.state)
            .collections
            .get(&(kind, collection.clone()))
            .and_then(|m| m.version.clone())
    }

    // ========================================================================
    // Drafts
    // ========================================================================

    /// Set one field of an entity's draft, creating the draft if needed.
    ///
    /// With `prune_equal_values`, setting a field back to the entity's value removes
    /// it from the patch instead.
    #[tracing::instrument(level = "trace", skip(self, value), fields(id = %id))]
    pub fn set_draft_field(&self, kind: EntityKind, id: &EntityId, key: &str, value: Value) {
        {
            let mut state = lock(&self.state);
            let equal = self.config.prune_equal_values
                && state
                    .base(kind, id)
                    .is_some_and(|base| base.get(key).is_some_and(|current| deep_equal(current, &value)));
            if equal {
                state.drafts.remove_field(kind, id, key);
            } else {
                state.drafts.set_field(kind, id, key, value);
            }
        }
        self.emit(StoreEvent::DraftChanged {
            kind,
            id: id.clone(),
        });
    }

    /// Check if the draft changes anything relative to the current entity.
    pub fn is_dirty(&self, kind: EntityKind, id: &EntityId) -> bool {
        let state = lock(&self.state);
        change_tracker::is_dirty(state.base(kind, id).as_ref(), state.drafts.get(kind, id))
    }

    /// Changed fields of one entity.
    pub fn diff(&self, kind: EntityKind, id: &EntityId) -> Vec<FieldChange> {
        let state = lock(&self.state);
        change_tracker::diff(state.base(kind, id).as_ref(), state.drafts.get(kind, id))
    }

    pub fn has_draft(&self, kind: EntityKind, id: &EntityId) -> bool {
        lock(&self.state).drafts.contains(kind, id)
    }

    /// Discard the draft value of one field.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %id))]
    pub fn revert_field(&self, kind: EntityKind, id: &EntityId, key: &str) {
        let removed = lock(&self.state).drafts.remove_field(kind, id, key);
        if removed.is_some() {
            self.emit(StoreEvent::DraftChanged {
                kind,
                id: id.clone(),
            });
        }
    }

    /// Discard the whole draft.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn revert_all(&self, kind: EntityKind, id: &EntityId) {
        let removed = lock(&self.state).drafts.remove(kind, id);
        if removed.is_some() {
            self.emit(StoreEvent::DraftChanged {
                kind,
                id: id.clone(),
            });
        }
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    /// Create a row not tied to any collection.
    pub fn create_new(&self, kind: EntityKind) -> EntityId {
        self.create(kind, None)
    }

    /// Create a row in a collection; it is committed with that collection.
    pub fn create_new_in(&self, kind: EntityKind, collection: &CollectionId) -> EntityId {
        self.create(kind, Some(collection.clone()))
    }

    fn create(&self, kind: EntityKind, collection: Option<CollectionId>) -> EntityId {
        let id = {
            let mut state = lock(&self.state);
            let id = state.ledger.allocate(kind, collection);
            state.drafts.ensure(kind, &id);
            id
        };
        self.emit(StoreEvent::Created {
            kind,
            id: id.clone(),
        });
        id
    }

    /// Mark a row deleted. Locally created rows are discarded along with their draft.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn mark_deleted(&self, kind: EntityKind, id: &EntityId) -> Deletion {
        let deletion = {
            let mut state = lock(&self.state);
            let deletion = state.ledger.mark_deleted(kind, id);
            if deletion == Deletion::DiscardedNew {
                state.drafts.remove(kind, id);
            }
            deletion
        };
        if deletion != Deletion::AlreadyDeleted {
            self.emit(StoreEvent::Deleted {
                kind,
                id: id.clone(),
            });
        }
        deletion
    }

    /// Undo a deletion mark. Returns false if the id was not marked.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn undo_delete(&self, kind: EntityKind, id: &EntityId) -> bool {
        let restored = lock(&self.state).ledger.undo_delete(kind, id);
        if restored {
            self.emit(StoreEvent::Restored {
                kind,
                id: id.clone(),
            });
        }
        restored
    }

    /// Server ids in order minus deletions, then locally created ids in creation order.
    pub fn list_visible(&self, kind: EntityKind) -> Vec<EntityId> {
        let state = lock(&self.state);
        state.ledger.visible(kind, state.entities.ids(kind))
    }

    /// Like [`EditSession::list_visible`], limited to one collection.
    pub fn list_visible_in(&self, kind: EntityKind, collection: &CollectionId) -> Vec<EntityId> {
        lock(&self.state).collection_ids(kind, collection)
    }

    pub fn pending_counts(&self, kind: EntityKind) -> PendingCounts {
        lock(&self.state).ledger.pending_counts(kind)
    }

    // ========================================================================
    // Columns
    // ========================================================================

    /// Effective columns of a collection.
    pub fn columns(&self, collection: &CollectionId) -> Vec<Column> {
        lock(&self.state).column_list(Some(collection))
    }

    /// Add a column. Returns its key.
    pub fn add_column(&self, collection: &CollectionId, name: &str) -> Result<String> {
        let key = lock(&self.state).columns_mut(collection).add(name)?;
        self.emit(StoreEvent::ColumnsChanged {
            collection: collection.clone(),
        });
        Ok(key)
    }

    /// Rename a column. Draft values under the old key follow the rename.
    ///
    /// Renaming onto the key of a field that rows carry outside the column set fails
    /// with `AlreadyExists`.
    pub fn rename_column(&self, collection: &CollectionId, old: &str, new: &str) -> Result<()> {
        {
            let mut state = lock(&self.state);
            let key = draftcache_core::column_key_for(new);
            if key != old && state.shadows_field(collection, &key) {
                return Err(Error::already_exists(collection.clone(), key));
            }
            state.columns_mut(collection).rename(old, new)?;
            for kind in EntityKind::ALL {
                for id in state.draft_ids(kind, collection) {
                    state.drafts.rename_key(kind, &id, old, &key);
                }
            }
        }
        self.emit(StoreEvent::ColumnsChanged {
            collection: collection.clone(),
        });
        Ok(())
    }

    /// Delete a column. Draft values under its key are dropped.
    ///
    /// Returns false if the collection has no such column.
    pub fn delete_column(&self, collection: &CollectionId, key: &str) -> bool {
        {
            let mut state = lock(&self.state);
            if !state.columns_mut(collection).delete(key) {
                return false;
            }
            for kind in EntityKind::ALL {
                for id in state.draft_ids(kind, collection) {
                    state.drafts.remove_field(kind, &id, key);
                }
            }
        }
        self.emit(StoreEvent::ColumnsChanged {
            collection: collection.clone(),
        });
        true
    }

    /// Undo a pending delete of a committed column.
    pub fn restore_column(&self, collection: &CollectionId, key: &str) -> Result<()> {
        lock(&self.state).columns_mut(collection).restore(key)?;
        self.emit(StoreEvent::ColumnsChanged {
            collection: collection.clone(),
        });
        Ok(())
    }

    pub fn column_changes(&self, collection: &CollectionId) -> ColumnChanges {
        lock(&self.state)
            .columns
            .get(collection)
            .map(ColumnState::changes)
            .unwrap_or_default()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Start a load of a collection. Any load started earlier becomes stale.
    pub fn begin_load(&self, kind: EntityKind, collection: &CollectionId) -> LoadTicket {
        let mut state = lock(&self.state);
        let meta = state.meta_mut(kind, collection);
        meta.generation += 1;
        LoadTicket {
            kind,
            collection: collection.clone(),
            generation: meta.generation,
        }
    }

    /// Make every outstanding load of the collection stale.
    #[tracing::instrument(level = "debug", skip(self), fields(collection = %collection))]
    pub fn invalidate_collection(&self, kind: EntityKind, collection: &CollectionId) {
        lock(&self.state).meta_mut(kind, collection).generation += 1;
    }

    /// Check if a ticket still matches its collection's generation.
    pub fn is_current(&self, ticket: &LoadTicket) -> bool {
        lock(&self.state)
            .collections
            .get(&(ticket.kind, ticket.collection.clone()))
            .is_some_and(|m| m.generation == ticket.generation)
    }

    /// Replace a collection with the records of `pages`, unless the ticket is stale.
    #[tracing::instrument(level = "debug", skip(self, ticket, pages), fields(collection = %ticket.collection))]
    pub fn apply_load(&self, ticket: &LoadTicket, pages: Vec<FetchPage>) -> LoadOutcome {
        let kind = ticket.kind;
        let records = {
            let mut state = lock(&self.state);
            let current = state
                .collections
                .get(&(kind, ticket.collection.clone()))
                .is_some_and(|m| m.generation == ticket.generation);
            if !current {
                tracing::warn!(pages = pages.len(), "Discarding stale load");
                return LoadOutcome::Stale;
            }

            let version = pages.iter().rev().find_map(|p| p.server_version.clone());
            let columns = pages.iter().rev().find_map(|p| p.columns.clone());
            let entities: Vec<Entity> = pages
                .into_iter()
                .flat_map(|p| p.records)
                .map(|r| Entity::from_record(r, version.clone(), Some(ticket.collection.clone())))
                .collect();
            let records = entities.len();
            state
                .entities
                .replace_collection(kind, &ticket.collection, entities);
            state.meta_mut(kind, &ticket.collection).version = version;
            if let Some(columns) = columns {
                state.columns_mut(&ticket.collection).set_committed(columns);
            }
            records
        };
        self.emit(StoreEvent::Hydrated {
            kind,
            count: records,
        });
        LoadOutcome::Applied { records }
    }

    /// Fetch every page of a collection and replace it in the store.
    ///
    /// Pages are only applied once all of them arrived and the load is still current.
    #[tracing::instrument(level = "info", skip(self, cx), fields(collection = %collection))]
    pub async fn load_collection(
        &self,
        cx: &Cx,
        kind: EntityKind,
        collection: &CollectionId,
    ) -> Outcome<LoadOutcome, Error> {
        let ticket = self.begin_load(kind, collection);
        let start = std::time::Instant::now();
        let mut pages: Vec<FetchPage> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = FetchRequest::first_page(kind, collection.clone()).with_cursor(cursor.clone());
            if let Some(size) = self.config.page_size {
                request = request.with_page_size(size);
            }
            let page = match self.backend.fetch_page(cx, &request).await {
                Outcome::Ok(page) => page,
                Outcome::Err(e) => {
                    tracing::warn!(error = %e, pages = pages.len(), "Collection load failed");
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if !self.is_current(&ticket) {
                tracing::warn!(pages = pages.len() + 1, "Load went stale mid-way");
                return Outcome::Ok(LoadOutcome::Stale);
            }

            let next = page.next_cursor.clone();
            pages.push(page);
            match next {
                None => break,
                Some(next) if Some(&next) == cursor.as_ref() => {
                    return Outcome::Err(Error::Custom(format!(
                        "backend returned the same cursor twice for {collection}"
                    )));
                }
                Some(next) => cursor = Some(next),
            }
        }

        let outcome = self.apply_load(&ticket, pages);
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            outcome = ?outcome,
            "Collection load complete"
        );
        Outcome::Ok(outcome)
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Fields that must be non-blank on every committed row of `kind`.
    pub fn require_fields<I, S>(&self, kind: EntityKind, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state)
            .required
            .insert(kind, fields.into_iter().map(Into::into).collect());
    }

    /// Pending changes of one collection, as a commit would see them now.
    pub fn change_summary(&self, kind: EntityKind, collection: &CollectionId) -> ChangeSummary {
        lock(&self.state)
            .plan(kind, collection, &self.config.missing_field_default)
            .summary()
    }

    pub fn commit_phase(&self, kind: EntityKind, collection: &CollectionId) -> CommitPhase {
        if lock(&self.state)
            .in_flight
            .contains(&(kind, collection.clone()))
        {
            CommitPhase::Saving
        } else {
            CommitPhase::Idle
        }
    }

    /// Commit the full state of one collection. Returns the new server version.
    ///
    /// On failure nothing changes locally. On success only the drafts, creations
    /// and deletions captured in the snapshot are cleared.
    #[tracing::instrument(level = "info", skip(self, cx, message), fields(kind = %kind, collection = %collection))]
    pub async fn commit(
        &self,
        cx: &Cx,
        kind: EntityKind,
        collection: &CollectionId,
        message: Option<String>,
    ) -> Outcome<String, Error> {
        let key = (kind, collection.clone());
        let (plan, required) = {
            let mut state = lock(&self.state);
            if !state.in_flight.insert(key.clone()) {
                tracing::warn!("Commit already in flight for collection");
                return Outcome::Err(Error::CommitInProgress {
                    kind,
                    collection: collection.clone(),
                });
            }
            let plan = state.plan(kind, collection, &self.config.missing_field_default);
            let required = state.required.get(&kind).cloned().unwrap_or_default();
            (plan, required)
        };
        let guard = InFlightGuard {
            state: &self.state,
            key,
        };

        // Fire before_commit event (can abort)
        if let Err(e) = self.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if let Err(errors) = plan.validate(&required) {
            tracing::debug!(errors = errors.len(), "Commit rejected by local validation");
            return Outcome::Err(Error::Validation(errors));
        }

        match plan.execute(cx, &self.backend, message).await {
            Outcome::Ok(response) => {
                let version = self.apply_commit(&plan, response);
                drop(guard);
                self.emit(StoreEvent::Committed {
                    kind,
                    collection: collection.clone(),
                    version: version.clone(),
                });
                if let Err(e) = self.fire(SessionEvent::AfterCommit) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(version)
            }
            Outcome::Err(e) => {
                drop(guard);
                self.emit(StoreEvent::CommitFailed {
                    kind,
                    collection: collection.clone(),
                });
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Adopt the server's state after a successful commit.
    fn apply_commit(&self, plan: &CommitPlan, response: CommitResponse) -> String {
        let CommitResponse {
            version,
            records,
            columns,
            id_map,
        } = response;
        let kind = plan.kind;
        let collection = &plan.collection;
        let mut state = lock(&self.state);

        let entities: Vec<Entity> = records
            .into_iter()
            .map(|r| Entity::from_record(r, Some(version.clone()), Some(collection.clone())))
            .collect();
        state.entities.replace_collection(kind, collection, entities);
        state.columns_mut(collection).rebase(columns, &plan.columns);

        let mut server_ids: HashMap<&EntityId, EntityId> = HashMap::new();
        for local in &plan.new_ids {
            match id_map.get(&local.to_string()) {
                Some(server) => {
                    server_ids.insert(local, EntityId::server(server.clone()));
                }
                None => tracing::warn!(id = %local, "Commit response did not map local id"),
            }
        }

        let captured: HashSet<&EntityId> = plan.drafts.keys().chain(plan.new_ids.iter()).collect();
        for id in captured {
            let Some(current) = state.drafts.get(kind, id) else {
                continue;
            };
            let unchanged = match plan.drafts.get(id) {
                Some(submitted) => current == submitted,
                None => current.is_empty(),
            };
            if unchanged || !self.config.keep_edits_during_commit || plan.deleted.contains(id) {
                state.drafts.remove(kind, id);
                continue;
            }

            let target = match server_ids.get(id) {
                Some(server) => server.clone(),
                None if id.is_local() => {
                    state.drafts.remove(kind, id);
                    continue;
                }
                None => id.clone(),
            };
            if &target != id {
                state.drafts.rekey(kind, id, target.clone());
            }
            if let Some(base) = state.base(kind, &target) {
                if let Some(draft) = state.drafts.get_mut(kind, &target) {
                    prune_unchanged(&base, draft);
                }
            }
            state.drafts.prune(kind, &target);
        }

        let cleared: HashSet<EntityId> = plan
            .new_ids
            .iter()
            .chain(plan.deleted.iter())
            .cloned()
            .collect();
        state.ledger.clear_ids(kind, &cleared);

        let meta = state.meta_mut(kind, collection);
        meta.version = Some(version.clone());
        // Loads started before the commit would overwrite it with older data.
        meta.generation += 1;
        version
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Copy of all local edit state, for comparing before and after an operation.
    pub fn edit_state(&self) -> EditStateSnapshot {
        let state = lock(&self.state);
        EditStateSnapshot {
            drafts: state.drafts.clone(),
            ledger: state.ledger.clone(),
            columns: state.columns.clone(),
        }
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let state = lock(&self.state);
        SessionDebugInfo {
            entities: EntityKind::ALL.iter().map(|k| state.entities.len(*k)).sum(),
            drafts: state.drafts.len(),
            pending_new: EntityKind::ALL
                .iter()
                .map(|k| state.ledger.pending_counts(*k).new)
                .sum(),
            pending_delete: EntityKind::ALL
                .iter()
                .map(|k| state.ledger.pending_counts(*k).deleted)
                .sum(),
            commits_in_flight: state.in_flight.len(),
        }
    }
}

/// Local edit state: drafts, ledger and column operations.
#[derive(Debug, Clone, PartialEq)]
pub struct EditStateSnapshot {
    pub drafts: DraftStore,
    pub ledger: Ledger,
    pub columns: HashMap<CollectionId, ColumnState>,
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    /// Total canonical entities.
    pub entities: usize,
    /// Entities with a draft.
    pub drafts: usize,
    /// Rows created locally.
    pub pending_new: usize,
    /// Rows marked deleted.
    pub pending_delete: usize,
    pub commits_in_flight: usize,
}

// ============================================================================
// Unit Tests
// ============================================================================
