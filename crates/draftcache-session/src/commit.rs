//! Commit planning and execution.
//!
//! A commit snapshots one collection's effective state (rows, columns, deletions),
//! validates it locally, and sends the full target state to the backend. The plan
//! remembers exactly which ids and draft patches it captured so that, on success,
//! only those are cleared and anything edited while the commit was in flight survives.

use crate::change_tracker::is_dirty;
use crate::columns::{ColumnChanges, ColumnState};
use crate::draft_store::{Draft, DraftStore};
use crate::entity_store::EntityStore;
use crate::ledger::Ledger;
use crate::merge::{base_fields, project_row};
use asupersync::{Cx, Outcome};
use draftcache_core::{
    Backend, CollectionId, CommitPayload, CommitResponse, CommitRow, EntityId, EntityKind, Error,
    FieldMap, ValidationError, is_blank,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// How a row differs from the committed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    Unchanged,
    Updated,
    Inserted,
}

/// One row of the target state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRow {
    pub id: EntityId,
    pub fields: FieldMap,
    pub change: RowChange,
}

/// Counts of pending changes for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    #[serde(skip)]
    pub columns: ColumnChanges,
}

impl ChangeSummary {
    /// Total number of row-level changes.
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    /// Check if there is nothing to commit.
    pub fn is_empty(&self) -> bool {
        self.total() == 0 && self.columns.is_empty()
    }
}

/// Snapshot of one collection, ready to be sent.
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub kind: EntityKind,
    pub collection: CollectionId,
    pub base_version: Option<String>,
    pub rows: Vec<PlannedRow>,
    /// Server ids marked deleted within this collection.
    pub deleted: Vec<EntityId>,
    /// Column state as submitted.
    pub columns: ColumnState,
    /// Draft patches as submitted, by id.
    pub drafts: HashMap<EntityId, Draft>,
    /// Locally created ids included in the plan.
    pub new_ids: Vec<EntityId>,
}

impl CommitPlan {
    /// Capture the current state of a collection.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = %kind, collection = %collection))]
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        kind: EntityKind,
        collection: &CollectionId,
        base_version: Option<String>,
        entities: &EntityStore,
        drafts: &DraftStore,
        ledger: &Ledger,
        columns: &ColumnState,
        missing: &Value,
    ) -> Self {
        let visible = ledger.visible_in(kind, collection, entities.ids_in(kind, collection));

        let mut rows = Vec::with_capacity(visible.len());
        let mut snapshot = HashMap::new();
        let mut new_ids = Vec::new();
        for id in visible {
            let entity = entities.peek(kind, &id);
            let draft = drafts.get(kind, &id);
            let change = match entity {
                None => RowChange::Inserted,
                Some(e) if is_dirty(Some(&base_fields(e, Some(columns))), draft) => {
                    RowChange::Updated
                }
                Some(_) => RowChange::Unchanged,
            };
            if change == RowChange::Inserted {
                new_ids.push(id.clone());
            }
            if let Some(draft) = draft {
                snapshot.insert(id.clone(), draft.clone());
            }
            rows.push(PlannedRow {
                fields: project_row(entity, draft, columns, missing),
                id,
                change,
            });
        }

        let deleted: Vec<EntityId> = ledger
            .deleted_ids(kind)
            .filter(|id| {
                entities
                    .peek(kind, id)
                    .is_some_and(|e| e.collection() == Some(collection))
            })
            .cloned()
            .collect();
        for id in &deleted {
            if let Some(draft) = drafts.get(kind, id) {
                snapshot.insert(id.clone(), draft.clone());
            }
        }

        tracing::debug!(
            rows = rows.len(),
            deleted = deleted.len(),
            new = new_ids.len(),
            "Built commit plan"
        );

        Self {
            kind,
            collection: collection.clone(),
            base_version,
            rows,
            deleted,
            columns: columns.clone(),
            drafts: snapshot,
            new_ids,
        }
    }

    /// Local checks before anything is sent.
    ///
    /// Column keys must be non-empty and unique; `required` fields must be non-blank
    /// on every row.
    pub fn validate(&self, required: &[String]) -> Result<(), ValidationError> {
        let mut errors = match self.columns.validate() {
            Ok(()) => ValidationError::new(),
            Err(e) => e,
        };
        for row in &self.rows {
            for field in required {
                if row.fields.get(field).is_none_or(is_blank) {
                    errors.add_required(field.clone(), row.id.clone());
                }
            }
        }
        errors.into_result()
    }

    /// Every id this plan commits: rows that changed plus deletions.
    pub fn scope(&self) -> HashSet<EntityId> {
        self.rows
            .iter()
            .map(|r| r.id.clone())
            .chain(self.deleted.iter().cloned())
            .collect()
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary {
            deleted: self.deleted.len(),
            columns: self.columns.changes(),
            ..ChangeSummary::default()
        };
        for row in &self.rows {
            match row.change {
                RowChange::Inserted => summary.added += 1,
                RowChange::Updated => summary.modified += 1,
                RowChange::Unchanged => {}
            }
        }
        summary
    }

    /// Full target state for the backend.
    pub fn to_payload(&self, message: Option<String>) -> CommitPayload {
        CommitPayload {
            kind: self.kind,
            collection: self.collection.clone(),
            base_version: self.base_version.clone(),
            message,
            columns: self.columns.effective_columns(),
            rows: self
                .rows
                .iter()
                .map(|r| CommitRow::for_id(&r.id, r.fields.clone()))
                .collect(),
            deleted: self.deleted.clone(),
        }
    }

    /// Send the plan to the backend.
    #[tracing::instrument(level = "info", skip(self, cx, backend, message), fields(kind = %self.kind, collection = %self.collection))]
    pub async fn execute<B: Backend>(
        &self,
        cx: &Cx,
        backend: &B,
        message: Option<String>,
    ) -> Outcome<CommitResponse, Error> {
        let summary = self.summary();
        tracing::info!(
            added = summary.added,
            modified = summary.modified,
            deleted = summary.deleted,
            columns_changed = !summary.columns.is_empty(),
            "Executing commit"
        );

        let start = std::time::Instant::now();
        let payload = self.to_payload(message);
        match backend.commit(cx, &payload).await {
            Outcome::Ok(response) => {
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis(),
                    version = %response.version,
                    rows = response.records.len(),
                    "Commit complete"
                );
                Outcome::Ok(response)
            }
            Outcome::Err(e) => {
                tracing::warn!(
                    elapsed_ms = start.elapsed().as_millis(),
                    error = %e,
                    "Commit failed"
                );
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}
