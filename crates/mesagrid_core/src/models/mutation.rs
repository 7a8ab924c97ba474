//! Single-row mutation models.

use crate::models::schema::TableRef;
use crate::models::value::Value;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One column of the key identifying the target row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPart {
    /// Primary key column
    pub column: String,
    /// Current value in the target row
    pub value: Value,
}

impl KeyPart {
    /// Create a key part.
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { column: column.into(), value: value.into() }
    }
}

/// What the mutation does to the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum MutationChange {
    /// Insert a new row from `(column, value)` pairs.
    Insert {
        /// Column values of the new row
        values: Vec<(String, Value)>,
    },
    /// Set one column of the keyed row.
    UpdateCell {
        /// Column to change
        column: String,
        /// New value
        value: Value,
    },
    /// Delete the keyed row.
    Delete,
}

/// A single-row insert, cell update or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    /// Profile to run against
    pub profile_id: Uuid,
    /// Target table
    pub table: TableRef,
    /// Primary key of the target row; empty for inserts
    pub key: Vec<KeyPart>,
    /// Change to apply
    pub change: MutationChange,
}

impl MutationRequest {
    /// Insert a row.
    pub fn insert(profile_id: Uuid, table: TableRef, values: Vec<(String, Value)>) -> Self {
        Self { profile_id, table, key: Vec::new(), change: MutationChange::Insert { values } }
    }

    /// Update one cell of the row identified by `key`.
    pub fn update_cell(
        profile_id: Uuid,
        table: TableRef,
        key: Vec<KeyPart>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            profile_id,
            table,
            key,
            change: MutationChange::UpdateCell { column: column.into(), value: value.into() },
        }
    }

    /// Delete the row identified by `key`.
    pub fn delete(profile_id: Uuid, table: TableRef, key: Vec<KeyPart>) -> Self {
        Self { profile_id, table, key, change: MutationChange::Delete }
    }

    /// Operation name for logs.
    pub fn operation(&self) -> &'static str {
        match self.change {
            MutationChange::Insert { .. } => "insert",
            MutationChange::UpdateCell { .. } => "update",
            MutationChange::Delete => "delete",
        }
    }
}

/// Outcome of a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    /// Always 1 on success
    pub rows_affected: u64,
    /// Statement round-trip time
    pub execution_time_ms: u64,
}
