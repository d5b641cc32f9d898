//! Request coalescing for draftcache.
//!
//! `draftcache-batch` turns many small lookups into few backend calls. Callers
//! `request` items into an open window; one `flush` sends one call per group key and
//! fans the grouped response back out, each caller receiving only the records that
//! match its own item.
//!
//! - [`BatchCoalescer`]: the generic window, parameterized by a [`BatchSource`]
//! - [`serialize_key`]: canonical request identity used for deduplication
//! - [`EvaluatorSource`]: evaluator lookups by id or slug, grouped per project

pub mod coalescer;
pub mod evaluator;
pub mod key;

pub use coalescer::{BatchCoalescer, BatchConfig, BatchSource, FlushReport, PendingRequest};
pub use evaluator::{EvaluatorBackend, EvaluatorQuery, EvaluatorRef, EvaluatorSource};
pub use key::serialize_key;
