//! Core types and traits for draftcache.
//!
//! This crate provides the foundations shared by the session and batch crates:
//!
//! - `Entity`, `EntityId`, `EntityKind` for canonical server records
//! - `deep_equal` and `canonical_key` for structural comparison of JSON-like values
//! - `Column` definitions for collections
//! - `Backend` trait for the remote side (fetch pages, commit collections)
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod backend;
pub mod column;
pub mod entity;
pub mod error;
pub mod value;

pub use backend::{Backend, CommitPayload, CommitResponse, CommitRow, FetchPage, FetchRequest};
pub use column::{Column, column_key_for};
pub use entity::{CollectionId, Entity, EntityId, EntityKind, EntityRecord, LocalId};
pub use error::{
    AlreadyExistsError, Error, FieldValidationError, NetworkError, NotFoundError, Result,
    ValidationError, ValidationErrorKind,
};
pub use value::{
    ArrayOrder, FieldMap, canonical_key, deep_equal, is_blank, maps_equal, option_equal,
};
