//! Pending column operations for a collection.
//!
//! A collection has a committed column set (what the server last reported) plus
//! pending adds, renames and deletes. Operations compose: renaming a pending add
//! rewrites the add, renaming A to B then B to C leaves a single A to C rename, and
//! renaming back to the original key cancels the rename.
//!
//! Conflicts are rejected when the operation is made, not at commit time.

use draftcache_core::{CollectionId, Column, Error, Result, ValidationError, column_key_for};
use std::collections::{HashMap, HashSet};

/// A rename of a committed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRename {
    /// Committed key.
    pub from: String,
    pub to: String,
}

/// Summary of pending column operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnChanges {
    pub added: Vec<String>,
    pub renamed: Vec<(String, String)>,
    pub deleted: Vec<String>,
}

impl ColumnChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.renamed.is_empty() && self.deleted.is_empty()
    }
}

/// Committed columns plus pending operations for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnState {
    collection: CollectionId,
    committed: Vec<Column>,
    pending_adds: Vec<Column>,
    pending_renames: Vec<PendingRename>,
    /// Committed keys.
    pending_deletes: Vec<String>,
}

impl ColumnState {
    /// Create a state with no pending operations.
    pub fn new(collection: CollectionId, committed: Vec<Column>) -> Self {
        Self {
            collection,
            committed,
            pending_adds: Vec::new(),
            pending_renames: Vec::new(),
            pending_deletes: Vec::new(),
        }
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    pub fn committed(&self) -> &[Column] {
        &self.committed
    }

    /// Current key of a committed column after pending renames.
    fn current_key<'a>(&'a self, committed_key: &'a str) -> &'a str {
        self.pending_renames
            .iter()
            .find(|r| r.from == committed_key)
            .map_or(committed_key, |r| r.to.as_str())
    }

    /// Committed key whose current key is `key`, if it is not pending deletion.
    fn committed_for_current(&self, key: &str) -> Option<&str> {
        self.committed
            .iter()
            .map(|c| c.key.as_str())
            .filter(|k| !self.pending_deletes.iter().any(|d| d.as_str() == *k))
            .find(|k| self.current_key(k) == key)
    }

    /// Keys the collection would have if committed now.
    pub fn proposed_keys(&self) -> Vec<String> {
        self.effective_columns().into_iter().map(|c| c.key).collect()
    }

    fn has_key(&self, key: &str) -> bool {
        self.committed_for_current(key).is_some() || self.pending_adds.iter().any(|c| c.key == key)
    }

    /// Columns after applying pending operations, committed columns first.
    pub fn effective_columns(&self) -> Vec<Column> {
        let mut out: Vec<Column> = self
            .committed
            .iter()
            .filter(|c| !self.pending_deletes.contains(&c.key))
            .map(|c| {
                let key = self.current_key(&c.key);
                if key == c.key {
                    c.clone()
                } else {
                    Column::keyed(key)
                }
            })
            .collect();
        out.extend(self.pending_adds.iter().cloned());
        out
    }

    /// Add a column. Returns its key.
    #[tracing::instrument(level = "debug", skip(self), fields(collection = %self.collection))]
    pub fn add(&mut self, name: &str) -> Result<String> {
        let key = column_key_for(name);
        if key.is_empty() {
            let mut errors = ValidationError::new();
            errors.add_empty_column();
            return Err(Error::Validation(errors));
        }
        if self.has_key(&key) {
            return Err(Error::already_exists(self.collection.clone(), key));
        }
        // Re-adding a column deleted in this session brings back its committed data.
        if let Some(pos) = self.pending_deletes.iter().position(|d| *d == key) {
            if self.current_key(&key) == key {
                self.pending_deletes.remove(pos);
                tracing::debug!(key = %key, "Re-added deleted column");
                return Ok(key);
            }
        }
        self.pending_adds.push(Column::new(key.clone(), name.trim()));
        Ok(key)
    }

    /// Rename a column by its current key.
    #[tracing::instrument(level = "debug", skip(self), fields(collection = %self.collection))]
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let new = column_key_for(new);
        if new.is_empty() {
            let mut errors = ValidationError::new();
            errors.add_empty_column();
            return Err(Error::Validation(errors));
        }
        if !self.has_key(old) {
            return Err(Error::column_not_found(self.collection.clone(), old));
        }
        if old == new {
            return Ok(());
        }
        if self.has_key(&new) {
            return Err(Error::already_exists(self.collection.clone(), new));
        }

        if let Some(add) = self.pending_adds.iter_mut().find(|c| c.key == old) {
            add.key = new.clone();
            add.name = new;
            return Ok(());
        }

        let Some(from) = self.committed_for_current(old).map(str::to_string) else {
            return Err(Error::column_not_found(self.collection.clone(), old));
        };
        self.pending_renames.retain(|r| r.from != from);
        if from != new {
            self.pending_renames.push(PendingRename { from, to: new });
        }
        Ok(())
    }

    /// Delete a column by its current key. Returns false if no such column exists.
    #[tracing::instrument(level = "debug", skip(self), fields(collection = %self.collection))]
    pub fn delete(&mut self, key: &str) -> bool {
        if let Some(pos) = self.pending_adds.iter().position(|c| c.key == key) {
            self.pending_adds.remove(pos);
            return true;
        }
        let Some(from) = self.committed_for_current(key).map(str::to_string) else {
            return false;
        };
        self.pending_renames.retain(|r| r.from != from);
        self.pending_deletes.push(from);
        true
    }

    /// Undo a pending delete of a committed column.
    pub fn restore(&mut self, committed_key: &str) -> Result<()> {
        let Some(pos) = self.pending_deletes.iter().position(|d| d == committed_key) else {
            return Err(Error::column_not_found(
                self.collection.clone(),
                committed_key,
            ));
        };
        if self.has_key(committed_key) {
            return Err(Error::already_exists(
                self.collection.clone(),
                committed_key,
            ));
        }
        self.pending_deletes.remove(pos);
        Ok(())
    }

    /// Committed key to current key for every surviving committed column.
    pub fn key_map(&self) -> HashMap<&str, &str> {
        self.committed
            .iter()
            .filter(|c| !self.pending_deletes.contains(&c.key))
            .map(|c| (c.key.as_str(), self.current_key(&c.key)))
            .collect()
    }

    /// Committed keys pending deletion.
    pub fn deleted_keys(&self) -> &[String] {
        &self.pending_deletes
    }

    pub fn has_changes(&self) -> bool {
        !(self.pending_adds.is_empty()
            && self.pending_renames.is_empty()
            && self.pending_deletes.is_empty())
    }

    pub fn changes(&self) -> ColumnChanges {
        ColumnChanges {
            added: self.pending_adds.iter().map(|c| c.key.clone()).collect(),
            renamed: self
                .pending_renames
                .iter()
                .map(|r| (r.from.clone(), r.to.clone()))
                .collect(),
            deleted: self.pending_deletes.clone(),
        }
    }

    /// Check the proposed column set for empty or duplicate keys.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        let mut seen = HashSet::new();
        for column in self.effective_columns() {
            if column.key.trim().is_empty() {
                errors.add_empty_column();
            } else if !seen.insert(column.key.clone()) {
                errors.add_duplicate_column(&column.key);
            }
        }
        errors.into_result()
    }

    /// Replace the committed set from a fetch, keeping pending operations that still apply.
    pub fn set_committed(&mut self, committed: Vec<Column>) {
        let keys: HashSet<&str> = committed.iter().map(|c| c.key.as_str()).collect();
        self.pending_renames.retain(|r| keys.contains(r.from.as_str()));
        self.pending_deletes.retain(|d| keys.contains(d.as_str()));
        self.pending_adds.retain(|c| !keys.contains(c.key.as_str()));
        self.committed = committed;
    }

    /// Adopt the columns a commit produced.
    ///
    /// Operations in `submitted` were persisted by the commit and are dropped.
    /// Operations made while the commit was in flight are carried over, translated
    /// through the renames the commit applied.
    pub fn rebase(&mut self, committed: Vec<Column>, submitted: &ColumnState) {
        let keys: HashSet<String> = committed.iter().map(|c| c.key.clone()).collect();

        let renames: Vec<PendingRename> = self
            .pending_renames
            .iter()
            .filter(|r| !submitted.pending_renames.contains(r))
            .map(|r| PendingRename {
                from: submitted.current_key(&r.from).to_string(),
                to: r.to.clone(),
            })
            .filter(|r| r.from != r.to && keys.contains(&r.from))
            .collect();
        let deletes: Vec<String> = self
            .pending_deletes
            .iter()
            .filter(|d| !submitted.pending_deletes.contains(d))
            .map(|d| submitted.current_key(d).to_string())
            .filter(|d| keys.contains(d))
            .collect();
        let adds: Vec<Column> = self
            .pending_adds
            .iter()
            .filter(|c| !submitted.pending_adds.iter().any(|s| s.key == c.key))
            .filter(|c| !keys.contains(&c.key))
            .cloned()
            .collect();

        self.committed = committed;
        self.pending_renames = renames;
        self.pending_deletes = deletes;
        self.pending_adds = adds;
    }
}
