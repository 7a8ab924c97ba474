//! Schema introspection models.

use serde::{Deserialize, Serialize};

/// Whether a relation is a base table or a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// Base table
    Table,
    /// View or materialized view
    View,
}

/// A table or view reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    /// Schema (PostgreSQL) or database (MySQL)
    pub schema: String,
    /// Relation name
    pub name: String,
    /// Table or view
    #[serde(rename = "type")]
    pub kind: TableKind,
    /// Catalog row estimate, when the engine keeps one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
}

/// Column metadata as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Engine-reported type name
    pub data_type: String,
    /// Whether NULL is allowed
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create column metadata.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self { name: name.into(), data_type: data_type.into(), nullable }
    }
}

/// Catalog column with key information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDetail {
    /// Name, type, nullability
    #[serde(flatten)]
    pub column: ColumnMetadata,
    /// Part of the primary key
    pub is_primary_key: bool,
    /// Covered by a single-column unique constraint or index
    pub is_unique: bool,
    /// Default expression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// 1-based position in the table
    pub ordinal_position: i32,
}

impl ColumnDetail {
    /// Column name.
    pub fn name(&self) -> &str {
        &self.column.name
    }
}

/// Schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema or database
    pub schema: String,
    /// Relation name
    pub name: String,
}

impl TableRef {
    /// Create a table reference.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { schema: schema.into(), name: name.into() }
    }

    /// `schema.name`, unquoted, for messages and cursor identity.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}
