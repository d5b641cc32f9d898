//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use draftcache::{
    Backend, CollectionId, Column, CommitPayload, CommitResponse, Cx, EntityKind, EntityRecord,
    Error, FetchPage, FetchRequest, FieldMap, Outcome,
};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoredCollection {
    pub records: Vec<EntityRecord>,
    pub columns: Vec<Column>,
    pub version: u64,
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub collections: HashMap<(EntityKind, CollectionId), StoredCollection>,
    pub payloads: Vec<CommitPayload>,
    pub fetch_calls: usize,
    pub fail_commits: bool,
    next_id: u64,
}

/// Backend keeping whole collections in memory, paginating two records per page.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub state: Arc<Mutex<ServerState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, kind: EntityKind, collection: &str, rows: &[(&str, &str, &str)]) {
        let records = rows
            .iter()
            .map(|(id, input, expected)| {
                let mut fields = FieldMap::new();
                fields.insert("input".into(), json!(input));
                fields.insert("expected".into(), json!(expected));
                EntityRecord::new(*id, fields)
            })
            .collect();
        self.state.lock().unwrap().collections.insert(
            (kind, CollectionId::new(collection)),
            StoredCollection {
                records,
                columns: vec![Column::keyed("input"), Column::keyed("expected")],
                version: 1,
            },
        );
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().unwrap().fail_commits = fail;
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().unwrap().payloads.len()
    }

    pub fn last_payload(&self) -> Option<CommitPayload> {
        self.state.lock().unwrap().payloads.last().cloned()
    }

    pub fn stored(&self, kind: EntityKind, collection: &str) -> StoredCollection {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(&(kind, CollectionId::new(collection)))
            .cloned()
            .unwrap_or_default()
    }
}

const PAGE: usize = 2;

impl Backend for MemoryBackend {
    fn fetch_page(
        &self,
        _cx: &Cx,
        request: &FetchRequest,
    ) -> impl Future<Output = Outcome<FetchPage, Error>> + Send {
        let state = Arc::clone(&self.state);
        let request = request.clone();
        async move {
            let mut guard = state.lock().unwrap();
            guard.fetch_calls += 1;
            let stored = guard
                .collections
                .get(&(request.kind, request.collection.clone()))
                .cloned()
                .unwrap_or_default();
            let start = request
                .cursor
                .as_deref()
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            let end = (start + PAGE).min(stored.records.len());
            Outcome::Ok(FetchPage {
                records: stored.records[start..end].to_vec(),
                server_version: Some(format!("v{}", stored.version)),
                next_cursor: (end < stored.records.len()).then(|| end.to_string()),
                total: Some(stored.records.len() as u64),
                columns: Some(stored.columns.clone()),
            })
        }
    }

    fn commit(
        &self,
        _cx: &Cx,
        payload: &CommitPayload,
    ) -> impl Future<Output = Outcome<CommitResponse, Error>> + Send {
        let state = Arc::clone(&self.state);
        let payload = payload.clone();
        async move {
            let mut guard = state.lock().unwrap();
            guard.payloads.push(payload.clone());
            if guard.fail_commits {
                return Outcome::Err(Error::network("backend unavailable"));
            }

            let mut id_map = HashMap::new();
            let mut records = Vec::with_capacity(payload.rows.len());
            for row in payload.rows {
                let id = match (row.id, row.local_ref) {
                    (Some(id), _) => id,
                    (None, Some(local)) => {
                        guard.next_id += 1;
                        let id = format!("tc-new-{}", guard.next_id);
                        id_map.insert(local, id.clone());
                        id
                    }
                    (None, None) => continue,
                };
                records.push(EntityRecord::new(id, row.fields));
            }

            let key = (payload.kind, payload.collection.clone());
            let stored = guard.collections.entry(key).or_default();
            stored.version += 1;
            stored.records = records.clone();
            stored.columns = payload.columns.clone();
            Outcome::Ok(CommitResponse {
                version: format!("v{}", stored.version),
                records,
                columns: payload.columns,
                id_map,
            })
        }
    }
}
