//! Merge engine: applies client operations to a document state.
//!
//! The room treats the engine as a pure function
//! `apply(state, op) -> (new_state, diff)`. The default [`RecordMerge`]
//! applies an operation's changes atomically and reports the net effect:
//!
//! ```text
//! state ──► [Put a] [Patch a] [Remove b] ──► new state
//!                         │
//!                         ▼
//!        diff { put: [a'], removed: [b] }
//! ```
//!
//! Operations touching disjoint records commute: applying `a` then `b`
//! yields the same state as `b` then `a`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::document::{DocumentState, Props, Record, RecordId, Schema};

/// One change inside an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Insert or replace a whole record
    Put(Record),
    /// Overwrite individual properties of an existing record
    Patch { id: RecordId, props: Props },
    /// Delete a record (absent records are ignored)
    Remove(RecordId),
}

/// A client mutation, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub schema_version: u32,
    pub changes: Vec<Change>,
}

impl Operation {
    pub fn new(schema_version: u32, changes: Vec<Change>) -> Self {
        Self {
            schema_version,
            changes,
        }
    }

    /// Single-record put.
    pub fn put(schema_version: u32, record: Record) -> Self {
        Self::new(schema_version, vec![Change::Put(record)])
    }

    /// Single-record removal.
    pub fn remove(schema_version: u32, id: impl Into<RecordId>) -> Self {
        Self::new(schema_version, vec![Change::Remove(id.into())])
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Net effect of one operation, broadcast to other sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordsDiff {
    /// Records created or modified, in their final form
    pub put: Vec<Record>,
    /// Records that no longer exist
    pub removed: Vec<RecordId>,
}

impl RecordsDiff {
    pub fn is_empty(&self) -> bool {
        self.put.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.put.len() + self.removed.len()
    }
}

/// Reasons an operation is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("schema version mismatch: room speaks v{expected}, operation carries v{actual}")]
    SchemaMismatch { expected: u32, actual: u32 },
    #[error("unknown record type '{0}'")]
    UnknownType(String),
    #[error("record id '{id}' does not match type '{type_name}'")]
    IdTypeMismatch { id: RecordId, type_name: String },
    #[error("cannot patch missing record '{0}'")]
    MissingRecord(RecordId),
    #[error("operation carries no changes")]
    Empty,
}

/// Applies operations to document state.
///
/// Implementations must be pure: no I/O, no interior mutation, and the
/// input state is never modified.
pub trait MergeEngine: Send + Sync {
    /// Schema operations are validated against.
    fn schema(&self) -> &Schema;

    /// Apply `op` to `state`, returning the new state and the diff to broadcast.
    fn apply(
        &self,
        state: &DocumentState,
        op: &Operation,
    ) -> Result<(DocumentState, RecordsDiff), MergeError>;
}

/// Default record-level merge engine.
#[derive(Debug, Clone, Default)]
pub struct RecordMerge {
    schema: Schema,
}

impl RecordMerge {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    fn validate_record(&self, record: &Record) -> Result<(), MergeError> {
        if !self.schema.accepts(&record.type_name) {
            return Err(MergeError::UnknownType(record.type_name.clone()));
        }
        if record.id.type_prefix() != Some(record.type_name.as_str()) {
            return Err(MergeError::IdTypeMismatch {
                id: record.id.clone(),
                type_name: record.type_name.clone(),
            });
        }
        Ok(())
    }
}

impl MergeEngine for RecordMerge {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn apply(
        &self,
        state: &DocumentState,
        op: &Operation,
    ) -> Result<(DocumentState, RecordsDiff), MergeError> {
        if op.schema_version != self.schema.version() {
            return Err(MergeError::SchemaMismatch {
                expected: self.schema.version(),
                actual: op.schema_version,
            });
        }
        if op.is_empty() {
            return Err(MergeError::Empty);
        }

        let mut next = state.clone();
        let mut touched = BTreeSet::new();

        for change in &op.changes {
            match change {
                Change::Put(record) => {
                    self.validate_record(record)?;
                    next.records.insert(record.id.clone(), record.clone());
                    touched.insert(record.id.clone());
                }
                Change::Patch { id, props } => {
                    let record = next
                        .records
                        .get_mut(id)
                        .ok_or_else(|| MergeError::MissingRecord(id.clone()))?;
                    record
                        .props
                        .extend(props.iter().map(|(k, v)| (k.clone(), v.clone())));
                    touched.insert(id.clone());
                }
                Change::Remove(id) => {
                    next.records.remove(id);
                    touched.insert(id.clone());
                }
            }
        }

        // Net effect relative to the input state
        let mut diff = RecordsDiff::default();
        for id in touched {
            match (state.records.get(&id), next.records.get(&id)) {
                (before, Some(after)) if before != Some(after) => diff.put.push(after.clone()),
                (Some(_), None) => diff.removed.push(id),
                _ => {}
            }
        }

        // No net change: hand back the input, sharing its record map
        if diff.is_empty() {
            return Ok((state.clone(), diff));
        }
        next.clock = state.clock + 1;

        Ok((next, diff))
    }
}
