//! Error types for draftcache operations.
//!
//! Local invariant violations (`NotFound`, `AlreadyExists`) are returned synchronously
//! from the store operations. Remote failures arrive through `Outcome::Err` from the
//! async operations. Nothing in this crate retries on its own.

use crate::entity::{CollectionId, EntityId, EntityKind};
use std::fmt;
use std::sync::Arc;

/// The primary error type for all draftcache operations.
///
/// `Clone` so a single batch failure can be handed to every waiter of a window.
#[derive(Debug, Clone)]
pub enum Error {
    /// Entity or column has no entity, no draft, and is not a locally-new id.
    NotFound(NotFoundError),
    /// A column add/rename target collides with an existing key.
    AlreadyExists(AlreadyExistsError),
    /// Commit-time validation failed (locally or on the server).
    Validation(ValidationError),
    /// Fetch, commit, or batch call failed in the transport.
    Network(NetworkError),
    /// A grouped batch call failed; every request of the window carries this.
    BatchFailure(Box<Error>),
    /// Another commit for the same collection is still in flight.
    CommitInProgress {
        kind: EntityKind,
        collection: CollectionId,
    },
    /// A lifecycle hook rejected the operation.
    Hook(String),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// What was looked up and not found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    Entity { kind: EntityKind, id: EntityId },
    Column { collection: CollectionId, key: String },
}

/// A key that is already taken in a collection's proposed column set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyExistsError {
    pub collection: CollectionId,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct NetworkError {
    pub message: String,
    /// HTTP-ish status if the transport reported one.
    pub status: Option<u16>,
    /// Whether the caller may reasonably retry. The core never acts on this.
    pub retryable: bool,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// Validation error, grouped per field (or `__collection__` for collection-level checks).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    pub errors: Vec<FieldValidationError>,
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    /// Field (column key) that failed validation
    pub field: String,
    /// Row the failure belongs to, if it is row-scoped
    pub row: Option<EntityId>,
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Two columns share a key
    DuplicateColumn,
    /// Column key is empty
    EmptyColumn,
    /// Required field is missing or blank
    Required,
    /// Value has the wrong shape
    Malformed,
    /// Rejected by the server
    Server,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        row: Option<EntityId>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            row,
            kind,
            message: message.into(),
        });
    }

    pub fn add_duplicate_column(&mut self, key: &str) {
        self.add(
            key,
            None,
            ValidationErrorKind::DuplicateColumn,
            format!("column '{key}' appears more than once"),
        );
    }

    pub fn add_empty_column(&mut self) {
        self.add(
            "__collection__",
            None,
            ValidationErrorKind::EmptyColumn,
            "column keys must not be empty",
        );
    }

    /// Add a required field error for one row.
    pub fn add_required(&mut self, field: impl Into<String>, row: EntityId) {
        self.add(field, Some(row), ValidationErrorKind::Required, "is required");
    }

    /// Check whether any error concerns the given field.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: false,
            source: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self.retryable = status >= 500 || status == 429;
        self
    }

    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl Error {
    pub fn entity_not_found(kind: EntityKind, id: EntityId) -> Self {
        Error::NotFound(NotFoundError::Entity { kind, id })
    }

    pub fn column_not_found(collection: CollectionId, key: impl Into<String>) -> Self {
        Error::NotFound(NotFoundError::Column {
            collection,
            key: key.into(),
        })
    }

    pub fn already_exists(collection: CollectionId, key: impl Into<String>) -> Self {
        Error::AlreadyExists(AlreadyExistsError {
            collection,
            key: key.into(),
        })
    }

    pub fn network(message: impl Into<String>) -> Self {
        Error::Network(NetworkError::new(message))
    }

    /// Is this a genuine absence (as opposed to a transport or validation failure)?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Did a local uniqueness check reject the mutation?
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Might the same call succeed if the caller retries it unchanged?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(n) => n.retryable,
            Error::BatchFailure(inner) => inner.is_retryable(),
            Error::CommitInProgress { .. } => true,
            _ => false,
        }
    }

    /// Get the validation errors if this is a validation failure.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(v) => Some(v),
            Error::BatchFailure(inner) => inner.validation(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::AlreadyExists(e) => write!(f, "Already exists: {}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Network(e) => {
                if let Some(status) = e.status {
                    write!(f, "Network error (status {}): {}", status, e.message)
                } else {
                    write!(f, "Network error: {}", e.message)
                }
            }
            Error::BatchFailure(inner) => write!(f, "Batch request failed: {}", inner),
            Error::CommitInProgress { kind, collection } => write!(
                f,
                "A commit for {} collection '{}' is already in flight",
                kind, collection
            ),
            Error::Hook(msg) => write!(f, "Rejected by hook: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Network(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::BatchFailure(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundError::Entity { kind, id } => write!(f, "{} '{}'", kind, id),
            NotFoundError::Column { collection, key } => {
                write!(f, "column '{}' in collection '{}'", key, collection)
            }
        }
    }
}

impl fmt::Display for AlreadyExistsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column '{}' in collection '{}'",
            self.key, self.collection
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| match &e.row {
                Some(row) => format!("{} (row {}): {}", e.field, row, e.message),
                None => format!("{}: {}", e.field, e.message),
            })
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        Error::Network(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for local (synchronous) operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_status_marks_retryable() {
        let err = Error::from(NetworkError::new("bad gateway").with_status(502));
        assert!(err.is_retryable());

        let err = Error::from(NetworkError::new("conflict").with_status(409));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_batch_failure_delegates_to_inner() {
        let inner = Error::from(NetworkError::new("timeout").retryable(true));
        let err = Error::BatchFailure(Box::new(inner));
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            err.to_string(),
            "Batch request failed: Network error: timeout"
        );
    }

    #[test]
    fn test_validation_display_lists_rows() {
        let mut v = ValidationError::new();
        v.add_required("input", EntityId::server("tc-1"));
        v.add_duplicate_column("output");
        let text = v.to_string();
        assert!(text.contains("input (row tc-1): is required"));
        assert!(text.contains("output: column 'output' appears more than once"));
        assert!(v.has_field("output"));
        assert!(v.into_result().is_err());
    }

    #[test]
    fn test_empty_validation_is_ok() {
        assert!(ValidationError::new().into_result().is_ok());
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::entity_not_found(EntityKind::Testcase, EntityId::server("abc"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: testcase 'abc'");
    }
}
