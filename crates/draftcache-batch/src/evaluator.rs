//! Batched evaluator lookups by reference.
//!
//! Many widgets ask for "the evaluator referenced as X" independently. Queries for
//! the same project and archive flag are merged into a single backend query that
//! carries the union of their references.

use crate::coalescer::BatchSource;
use asupersync::{Cx, Outcome};
use draftcache_core::{EntityRecord, Error};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Reference to an evaluator by id, slug, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluatorRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl EvaluatorRef {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            slug: None,
        }
    }

    pub fn by_slug(slug: impl Into<String>) -> Self {
        Self {
            id: None,
            slug: Some(slug.into()),
        }
    }

    /// Check if a record satisfies this reference.
    ///
    /// Id and slug are separate equality rules: an id matches the record id, a slug
    /// matches the record's `slug` field. A slug is never compared against an id.
    pub fn matches(&self, record: &EntityRecord) -> bool {
        let by_id = self.id.as_deref().is_some_and(|id| id == record.id);
        let by_slug = self.slug.as_deref().is_some_and(|slug| {
            record
                .fields
                .get("slug")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|s| s == slug)
        });
        by_id || by_slug
    }

    fn is_empty(&self) -> bool {
        self.id.is_none() && self.slug.is_none()
    }
}

/// One caller's evaluator query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorQuery {
    pub project_id: String,
    #[serde(default)]
    pub include_archived: bool,
    pub refs: Vec<EvaluatorRef>,
}

impl EvaluatorQuery {
    pub fn new(project_id: impl Into<String>, refs: Vec<EvaluatorRef>) -> Self {
        Self {
            project_id: project_id.into(),
            include_archived: false,
            refs,
        }
    }

    pub fn include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }
}

/// Backend endpoint answering a list of evaluator references.
pub trait EvaluatorBackend: Send + Sync {
    fn query_evaluators(
        &self,
        cx: &Cx,
        project_id: &str,
        include_archived: bool,
        refs: &[EvaluatorRef],
    ) -> impl Future<Output = Outcome<Vec<EntityRecord>, Error>> + Send;
}

/// [`BatchSource`] for evaluator queries.
pub struct EvaluatorSource<B> {
    backend: B,
}

impl<B: EvaluatorBackend> EvaluatorSource<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Union of the references of several queries, first occurrence first.
fn union_refs(items: &[EvaluatorQuery]) -> Vec<EvaluatorRef> {
    let mut refs: Vec<EvaluatorRef> = Vec::new();
    for r in items.iter().flat_map(|q| &q.refs) {
        if !r.is_empty() && !refs.contains(r) {
            refs.push(r.clone());
        }
    }
    refs
}

impl<B: EvaluatorBackend> BatchSource for EvaluatorSource<B> {
    type Item = EvaluatorQuery;
    type Record = EntityRecord;

    fn group_key(&self, item: &EvaluatorQuery) -> String {
        format!("{}|archived={}", item.project_id, item.include_archived)
    }

    fn fetch_group(
        &self,
        cx: &Cx,
        _group: &str,
        items: &[EvaluatorQuery],
    ) -> impl Future<Output = Outcome<Vec<EntityRecord>, Error>> + Send {
        // Every item in a group shares project and flags.
        let project_id = items
            .first()
            .map(|q| q.project_id.clone())
            .unwrap_or_default();
        let include_archived = items.first().is_some_and(|q| q.include_archived);
        let refs = union_refs(items);
        tracing::debug!(
            project_id = %project_id,
            refs = refs.len(),
            queries = items.len(),
            "Querying evaluators"
        );
        async move {
            if refs.is_empty() {
                return Outcome::Ok(Vec::new());
            }
            self.backend
                .query_evaluators(cx, &project_id, include_archived, &refs)
                .await
        }
    }

    fn matches(&self, item: &EvaluatorQuery, record: &EntityRecord) -> bool {
        item.refs.iter().any(|r| r.matches(record))
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use crate::coalescer::BatchCoalescer;
    use asupersync::runtime::RuntimeBuilder;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn evaluator(id: &str, slug: &str) -> EntityRecord {
        let fields = json!({"slug": slug, "name": format!("Evaluator {slug}")});
        EntityRecord::new(id, fields.as_object().cloned().unwrap_or_default())
    }

    struct MockBackend {
        records: Vec<EntityRecord>,
        calls: Arc<Mutex<Vec<Vec<EvaluatorRef>>>>,
    }

    impl EvaluatorBackend for MockBackend {
        fn query_evaluators(
            &self,
            _cx: &Cx,
            _project_id: &str,
            _include_archived: bool,
            refs: &[EvaluatorRef],
        ) -> impl Future<Output = Outcome<Vec<EntityRecord>, Error>> + Send {
            self.calls.lock().expect("lock poisoned").push(refs.to_vec());
            let found: Vec<EntityRecord> = self
                .records
                .iter()
                .filter(|r| refs.iter().any(|x| x.matches(r)))
                .cloned()
                .collect();
            async move { Outcome::Ok(found) }
        }
    }

    fn backend(calls: &Arc<Mutex<Vec<Vec<EvaluatorRef>>>>) -> MockBackend {
        MockBackend {
            records: vec![
                evaluator("ev-1", "exact-match"),
                evaluator("ev-2", "contains"),
                evaluator("ev-3", "llm-judge"),
                evaluator("ev-4", "ev-1"),
            ],
            calls: Arc::clone(calls),
        }
    }

    #[test]
    fn test_slug_never_matches_id() {
        let record = evaluator("ev-1", "exact-match");
        assert!(EvaluatorRef::by_id("ev-1").matches(&record));
        assert!(EvaluatorRef::by_slug("exact-match").matches(&record));
        assert!(!EvaluatorRef::by_slug("ev-1").matches(&record));
        assert!(!EvaluatorRef::by_id("exact-match").matches(&record));
        assert!(!EvaluatorRef::default().matches(&record));
    }

    #[test]
    fn test_group_key_separates_projects_and_flags() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let source = EvaluatorSource::new(backend(&calls));
        let a = EvaluatorQuery::new("p1", vec![]);
        let b = EvaluatorQuery::new("p1", vec![]).include_archived(true);
        let c = EvaluatorQuery::new("p2", vec![]);
        assert_ne!(source.group_key(&a), source.group_key(&b));
        assert_ne!(source.group_key(&a), source.group_key(&c));
    }

    #[test]
    fn test_five_queries_one_call() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let batcher = BatchCoalescer::new(EvaluatorSource::new(backend(&calls)));

        let queries = vec![
            EvaluatorQuery::new("p1", vec![EvaluatorRef::by_id("ev-1")]),
            EvaluatorQuery::new("p1", vec![EvaluatorRef::by_slug("contains")]),
            EvaluatorQuery::new("p1", vec![EvaluatorRef::by_slug("llm-judge")]),
            EvaluatorQuery::new(
                "p1",
                vec![EvaluatorRef::by_id("ev-2"), EvaluatorRef::by_slug("exact-match")],
            ),
            EvaluatorQuery::new("p1", vec![EvaluatorRef::by_slug("ev-1")]),
        ];

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let results = rt.block_on(async { unwrap_outcome(batcher.fetch_many(&cx, queries).await) });

        let ids: Vec<Vec<&str>> = results
            .iter()
            .map(|rows| rows.iter().map(|r| r.id.as_str()).collect())
            .collect();
        assert_eq!(
            ids,
            vec![
                vec!["ev-1"],
                vec!["ev-2"],
                vec!["ev-3"],
                vec!["ev-1", "ev-2"],
                vec!["ev-4"],
            ]
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 6);
    }

    #[test]
    fn test_union_skips_duplicates_and_empty_refs() {
        let refs = union_refs(&[
            EvaluatorQuery::new("p", vec![EvaluatorRef::by_id("a"), EvaluatorRef::default()]),
            EvaluatorQuery::new("p", vec![EvaluatorRef::by_id("a"), EvaluatorRef::by_slug("b")]),
        ]);
        assert_eq!(refs, vec![EvaluatorRef::by_id("a"), EvaluatorRef::by_slug("b")]);
    }
}
