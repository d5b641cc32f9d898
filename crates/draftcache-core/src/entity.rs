//! Entity identity and canonical records.
//!
//! An [`Entity`] is an immutable snapshot of one server record. Stores hold entities
//! behind `Arc` and replace them wholesale, so `Arc::ptr_eq` means "unchanged".

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::LazyLock;

use crate::value::FieldMap;

/// Kind of domain entity a store table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Testcase,
    Revision,
    Evaluator,
    Span,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Testcase,
        EntityKind::Revision,
        EntityKind::Evaluator,
        EntityKind::Span,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Testcase => "testcase",
            EntityKind::Revision => "revision",
            EntityKind::Evaluator => "evaluator",
            EntityKind::Span => "span",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an entity created locally and not yet persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId {
    kind: EntityKind,
    seq: u64,
}

impl LocalId {
    pub const fn new(kind: EntityKind, seq: u64) -> Self {
        Self { kind, seq }
    }

    pub const fn kind(self) -> EntityKind {
        self.kind
    }

    pub const fn seq(self) -> u64 {
        self.seq
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}:{}", self.kind, self.seq)
    }
}

static LOCAL_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^local:(testcase|revision|evaluator|span):([0-9]+)$")
        .unwrap_or_else(|e| unreachable!("static local id pattern: {e}"))
});

/// Stable key of an entity within its kind.
///
/// Server ids and local ids are different variants, so a locally created id can
/// never be equal to anything the backend hands out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Server(String),
    Local(LocalId),
}

impl EntityId {
    pub fn server(id: impl Into<String>) -> Self {
        EntityId::Server(id.into())
    }

    /// Parse an id that a UI layer rendered with `Display`.
    ///
    /// Only use this for strings that came from `to_string()` on an `EntityId`;
    /// ids coming from the backend always go through [`EntityId::server`].
    pub fn parse(s: &str) -> Self {
        if let Some(caps) = LOCAL_ID_RE.captures(s) {
            let kind = EntityKind::parse(&caps[1]);
            let seq = caps[2].parse::<u64>().ok();
            if let (Some(kind), Some(seq)) = (kind, seq) {
                return EntityId::Local(LocalId::new(kind, seq));
            }
        }
        EntityId::Server(s.to_string())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EntityId::Local(_))
    }

    pub fn as_server(&self) -> Option<&str> {
        match self {
            EntityId::Server(s) => Some(s),
            EntityId::Local(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Server(s) => f.write_str(s),
            EntityId::Local(l) => l.fmt(f),
        }
    }
}

impl From<LocalId> for EntityId {
    fn from(id: LocalId) -> Self {
        EntityId::Local(id)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    /// Anything arriving over the wire is a server id.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(EntityId::Server)
    }
}

/// Identifier of a collection (e.g. one testset revision's testcases).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CollectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A record as returned by the backend, before it is stamped into an [`Entity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Canonical server-fetched entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    fields: FieldMap,
    server_version: Option<String>,
    collection: Option<CollectionId>,
}

impl Entity {
    pub fn new(id: EntityId, fields: FieldMap) -> Self {
        Self {
            id,
            fields,
            server_version: None,
            collection: None,
        }
    }

    /// Stamp a backend record with the snapshot it came from.
    pub fn from_record(
        record: EntityRecord,
        server_version: Option<String>,
        collection: Option<CollectionId>,
    ) -> Self {
        Self {
            id: EntityId::Server(record.id),
            fields: record.fields,
            server_version,
            collection,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn in_collection(mut self, collection: CollectionId) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn collection(&self) -> Option<&CollectionId> {
        self.collection.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_and_server_ids_never_equal() {
        let local = EntityId::Local(LocalId::new(EntityKind::Testcase, 1));
        let server = EntityId::server("local:testcase:1");
        assert_eq!(local.to_string(), "local:testcase:1");
        assert_ne!(local, server);
    }

    #[test]
    fn test_parse_round_trips_display() {
        let local = EntityId::Local(LocalId::new(EntityKind::Span, 42));
        assert_eq!(EntityId::parse(&local.to_string()), local);
        assert_eq!(
            EntityId::parse("0190a6f4-7b1e"),
            EntityId::server("0190a6f4-7b1e")
        );
        assert_eq!(
            EntityId::parse("local:widget:1"),
            EntityId::server("local:widget:1")
        );
    }

    #[test]
    fn test_deserialized_ids_are_server_ids() {
        let id: EntityId = serde_json::from_value(json!("local:testcase:7")).unwrap();
        assert!(!id.is_local());
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("local:testcase:7"));
    }

    #[test]
    fn test_entity_from_record() {
        let record: EntityRecord =
            serde_json::from_value(json!({"id": "tc-1", "fields": {"input": "hi"}})).unwrap();
        let entity = Entity::from_record(record, Some("rev-3".into()), Some("ts-1".into()));
        assert_eq!(entity.id(), &EntityId::server("tc-1"));
        assert_eq!(entity.field("input"), Some(&json!("hi")));
        assert_eq!(entity.server_version(), Some("rev-3"));
        assert_eq!(entity.collection().map(CollectionId::as_str), Some("ts-1"));
    }

    #[test]
    fn test_kind_parse() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("dataset"), None);
    }
}
