//! draftcache - a client-side entity cache for editing server data locally.
//!
//! draftcache keeps server-fetched entities (testcases, testset revisions,
//! evaluators, trace spans) and layers local edits over them without touching the
//! canonical copy:
//!
//! - Drafts hold only the fields a user changed and disappear once they match the server
//! - Dirty state and field diffs are derived, never stored
//! - Creations, deletions and column changes are staged in a ledger until commit
//! - A commit sends the full target state of one collection and clears exactly what it sent
//! - Lookups issued together are coalesced into one backend call per group
//!
//! # Quick Start
//!
//! ```ignore
//! use draftcache::prelude::*;
//!
//! async fn edit(cx: &Cx, backend: impl Backend) {
//!     let session = EditSession::new(backend);
//!     let testset = CollectionId::new("ts-1");
//!
//!     session.load_collection(cx, EntityKind::Testcase, &testset).await;
//!
//!     let id = EntityId::server("tc-1");
//!     session.set_draft_field(EntityKind::Testcase, &id, "input", json!("hello"));
//!     assert!(session.is_dirty(EntityKind::Testcase, &id));
//!
//!     let row = session.create_new_in(EntityKind::Testcase, &testset);
//!     session.set_draft_field(EntityKind::Testcase, &row, "input", json!("new row"));
//!     session.rename_column(&testset, "expected", "reference")?;
//!
//!     match session.commit(cx, EntityKind::Testcase, &testset, None).await {
//!         Outcome::Ok(version) => println!("saved as {version}"),
//!         Outcome::Err(e) => eprintln!("nothing lost, retry later: {e}"),
//!         _ => {}
//!     }
//! }
//! ```
//!
//! # Crates
//!
//! - `draftcache-core`: entities, values, columns, errors and the `Backend` trait
//! - `draftcache-session`: stores, ledger, column state and the `EditSession`
//! - `draftcache-batch`: the request coalescer and evaluator lookups

pub use draftcache_core::{
    AlreadyExistsError, ArrayOrder, Backend, CollectionId, Column, CommitPayload,
    CommitResponse, CommitRow, Cx, Entity, EntityId, EntityKind, EntityRecord, Error,
    FetchPage, FetchRequest, FieldMap, FieldValidationError, LocalId, NetworkError,
    NotFoundError, Outcome, Result, ValidationError, ValidationErrorKind, canonical_key,
    column_key_for, deep_equal, is_blank,
};

pub use draftcache_session::{
    ChangeSummary, ColumnChanges, ColumnState, CommitPhase, Deletion, Draft, EditSession,
    EditStateSnapshot, FieldChange, LoadOutcome, LoadTicket, PendingCounts, SessionConfig,
    SessionDebugInfo, SessionEvent, StoreEvent, SubscriptionId,
};

pub use draftcache_batch::{
    BatchCoalescer, BatchConfig, BatchSource, EvaluatorBackend, EvaluatorQuery,
    EvaluatorRef, EvaluatorSource, FlushReport, PendingRequest, serialize_key,
};

/// Lower-level building blocks, for callers composing their own session.
pub mod stores {
    pub use draftcache_session::{
        CommitPlan, DraftStore, EntityStore, Ledger, PlannedRow, RowChange, change_tracker,
        merge,
    };
}

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        // Core
        Backend,
        // Batch
        BatchCoalescer,
        BatchConfig,
        BatchSource,
        CollectionId,
        Column,
        CommitPhase,
        Cx,
        Deletion,
        // Session
        EditSession,
        Entity,
        EntityId,
        EntityKind,
        EntityRecord,
        Error,
        EvaluatorQuery,
        EvaluatorRef,
        EvaluatorSource,
        FetchPage,
        FieldMap,
        Outcome,
        Result,
        SessionConfig,
        StoreEvent,
    };
    pub use serde_json::json;
}
