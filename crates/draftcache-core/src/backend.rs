//! Backend trait and the shapes exchanged with it.
//!
//! The cache never speaks HTTP itself. A `Backend` fetches pages of records for a
//! collection and accepts whole-collection commit payloads. All operations are async
//! and integrate with asupersync's structured concurrency via `Cx` and `Outcome`.

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

use crate::Error;
use crate::column::Column;
use crate::entity::{CollectionId, EntityId, EntityKind, EntityRecord};
use crate::value::FieldMap;

/// Request for one page of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub kind: EntityKind,
    pub collection: CollectionId,
    /// Pagination cursor from the previous page, `None` for the first page.
    pub cursor: Option<String>,
    pub page_size: Option<usize>,
}

impl FetchRequest {
    pub fn first_page(kind: EntityKind, collection: CollectionId) -> Self {
        Self {
            kind,
            collection,
            cursor: None,
            page_size: None,
        }
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// One page of records, in server order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchPage {
    pub records: Vec<EntityRecord>,
    /// Snapshot token (revision id, `updated_at`, ...) the records belong to.
    pub server_version: Option<String>,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
    /// Column set of the collection, when the backend reports one.
    pub columns: Option<Vec<Column>>,
}

/// One row of the target state sent on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRow {
    /// Server id; `None` for rows created locally.
    pub id: Option<String>,
    /// Client reference for locally created rows, echoed back in `CommitResponse::id_map`.
    pub local_ref: Option<String>,
    pub fields: FieldMap,
}

impl CommitRow {
    pub fn for_id(id: &EntityId, fields: FieldMap) -> Self {
        match id {
            EntityId::Server(s) => Self {
                id: Some(s.clone()),
                local_ref: None,
                fields,
            },
            EntityId::Local(l) => Self {
                id: None,
                local_ref: Some(l.to_string()),
                fields,
            },
        }
    }
}

/// Full target state of a collection.
///
/// This is not a diff: the backend creates a new version holding exactly `rows`
/// with exactly `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub kind: EntityKind,
    pub collection: CollectionId,
    /// Version the edits were made against.
    pub base_version: Option<String>,
    pub message: Option<String>,
    pub columns: Vec<Column>,
    pub rows: Vec<CommitRow>,
    /// Server ids removed by this commit.
    pub deleted: Vec<EntityId>,
}

/// Authoritative state after a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Token of the newly created version.
    pub version: String,
    pub records: Vec<EntityRecord>,
    pub columns: Vec<Column>,
    /// `local_ref` -> server id for rows that were created locally.
    #[serde(default)]
    pub id_map: HashMap<String, String>,
}

/// The remote side of the cache.
pub trait Backend: Send + Sync {
    /// Fetch one page of a collection.
    fn fetch_page(
        &self,
        cx: &Cx,
        request: &FetchRequest,
    ) -> impl Future<Output = Outcome<FetchPage, Error>> + Send;

    /// Persist the full target state of a collection as a new version.
    fn commit(
        &self,
        cx: &Cx,
        payload: &CommitPayload,
    ) -> impl Future<Output = Outcome<CommitResponse, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::LocalId;
    use serde_json::json;

    #[test]
    fn test_commit_row_for_local_id_has_no_server_id() {
        let id = EntityId::Local(LocalId::new(EntityKind::Testcase, 3));
        let row = CommitRow::for_id(&id, FieldMap::new());
        assert_eq!(row.id, None);
        assert_eq!(row.local_ref.as_deref(), Some("local:testcase:3"));
    }

    #[test]
    fn test_commit_response_id_map_defaults() {
        let resp: CommitResponse = serde_json::from_value(json!({
            "version": "rev-2",
            "records": [],
            "columns": [{"key": "input", "name": "input"}]
        }))
        .unwrap();
        assert!(resp.id_map.is_empty());
        assert_eq!(resp.columns, vec![Column::keyed("input")]);
    }

    #[test]
    fn test_payload_serializes_ids_as_strings() {
        let payload = CommitPayload {
            kind: EntityKind::Testcase,
            collection: CollectionId::new("ts-1"),
            base_version: Some("rev-1".into()),
            message: None,
            columns: vec![Column::keyed("input")],
            rows: vec![],
            deleted: vec![EntityId::server("tc-9")],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["deleted"], json!(["tc-9"]));
        assert_eq!(value["kind"], json!("testcase"));
    }
}
