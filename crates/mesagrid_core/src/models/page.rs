//! Pagination models and the opaque cursor token.

use crate::error::QueryError;
use crate::models::schema::ColumnMetadata;
use crate::models::value::{Row, Value};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Order in which pages walk the ordering key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending key order
    #[default]
    Asc,
    /// Descending key order
    Desc,
}

impl SortDirection {
    /// SQL keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Strict comparison that moves past the last seen key.
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Asc => ">",
            Self::Desc => "<",
        }
    }
}

/// How the total row count is obtained, if at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMode {
    /// `COUNT(*)`
    Exact,
    /// Catalog estimate, falling back to exact when none exists
    Approximate,
    /// No count query
    #[default]
    Skip,
}

/// How a page was positioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagingStrategy {
    /// Stable "greater than last key" predicates
    Keyset,
    /// `LIMIT/OFFSET`; rows may shift under concurrent writes
    Offset,
}

/// Options for one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageOptions {
    /// Rows per page
    pub page_size: usize,
    /// Total count policy
    #[serde(default)]
    pub count: CountMode,
    /// Key order for the first page; later pages follow the cursor
    #[serde(default)]
    pub direction: SortDirection,
}

impl PageOptions {
    /// Ascending pages without a count.
    pub fn new(page_size: usize) -> Self {
        Self { page_size, count: CountMode::Skip, direction: SortDirection::Asc }
    }

    /// Request a total count.
    pub fn with_count(mut self, count: CountMode) -> Self {
        self.count = count;
        self
    }

    /// Walk the key in the given direction.
    pub fn with_direction(mut self, direction: SortDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// One window of table rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Column metadata in table order
    pub columns: Vec<ColumnMetadata>,
    /// At most `page_size` rows
    pub rows: Vec<Row>,
    /// Token for the following page; `None` on the last page
    pub next_cursor: Option<String>,
    /// More rows exist after this page
    pub has_more: bool,
    /// Total rows, when a count was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<i64>,
    /// How the page was positioned
    pub strategy: PagingStrategy,
}

/// Position after the last row of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CursorPosition {
    /// Last seen values of the ordering key.
    Keyset {
        /// Key columns in order
        columns: Vec<String>,
        /// Key values of the last returned row
        last: Vec<Value>,
        /// Walk direction
        direction: SortDirection,
    },
    /// Numeric offset of the next row.
    Offset {
        /// Rows already returned
        offset: usize,
    },
}

/// Decoded pagination token, bound to one table of one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Profile, engine and qualified table the cursor was minted for
    pub table: String,
    /// Where the next page starts
    pub position: CursorPosition,
}

impl Cursor {
    /// Encode as an opaque URL-safe token.
    pub fn encode(&self) -> Result<String, QueryError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| QueryError::InvalidCursor(format!("cannot encode cursor: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a token produced by [`Cursor::encode`].
    pub fn decode(token: &str) -> Result<Self, QueryError> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| QueryError::InvalidCursor("not a cursor token".to_string()))?;
        serde_json::from_slice(&json)
            .map_err(|_| QueryError::InvalidCursor("malformed cursor".to_string()))
    }

    /// Reject a cursor minted for another table.
    pub fn ensure_table(&self, table: &str) -> Result<(), QueryError> {
        if self.table == table {
            Ok(())
        } else {
            Err(QueryError::InvalidCursor(format!(
                "cursor belongs to {}, not {table}",
                self.table
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_token_is_opaque_and_decodes() {
        let cursor = Cursor {
            table: "postgres:public.users".into(),
            position: CursorPosition::Keyset {
                columns: vec!["id".into()],
                last: vec![Value::Integer(2)],
                direction: SortDirection::Asc,
            },
        };
        let token = cursor.encode().unwrap();
        assert!(!token.contains('{'));
        assert!(!token.contains('='));
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn test_cursor_for_other_table_is_rejected() {
        let cursor = Cursor {
            table: "postgres:public.users".into(),
            position: CursorPosition::Offset { offset: 4 },
        };
        assert!(cursor.ensure_table("postgres:public.users").is_ok());
        let err = cursor.ensure_table("postgres:public.orders").unwrap_err();
        assert_eq!(err.kind(), "InvalidCursor");
    }

    #[test]
    fn test_garbage_token_is_invalid_cursor() {
        assert!(matches!(Cursor::decode("%%%"), Err(QueryError::InvalidCursor(_))));
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert!(matches!(Cursor::decode(&not_json), Err(QueryError::InvalidCursor(_))));
    }

    #[test]
    fn test_direction_operators() {
        assert_eq!(SortDirection::Asc.operator(), ">");
        assert_eq!(SortDirection::Desc.keyword(), "DESC");
    }
}
