//! Column definitions for entity collections.

use serde::{Deserialize, Serialize};

/// One field ("column") of a collection, unique by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub key: String,
    pub name: String,
}

impl Column {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }

    /// Column whose display name is its key.
    pub fn keyed(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
        }
    }
}

/// Derive a column key from a user-entered name.
pub fn column_key_for(name: &str) -> String {
    name.trim().to_string()
}
