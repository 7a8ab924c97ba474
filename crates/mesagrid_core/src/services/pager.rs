//! Table browsing in bounded pages.
//!
//! Tables with an ordering key are walked with keyset predicates, which stay
//! stable under concurrent inserts. Tables without one fall back to
//! `LIMIT/OFFSET`, where rows may shift between pages under concurrent writes.
//! Every page fetches one row beyond the page size to learn whether more
//! rows exist, so no page ever touches more than `page_size + 1` rows.

use crate::config::PagerConfig;
use crate::engine::{dialect, QuerySpec};
use crate::error::QueryError;
use crate::models::{
    ColumnDetail, ColumnMetadata, CountMode, Cursor, CursorPosition, EngineType, Page,
    PageOptions, PagingStrategy, Row, SortDirection, TableRef, Value,
};
use crate::services::pool::ProfilePool;
use crate::services::registry::ConnectionRegistry;
use crate::services::schema::{ordering_key_of, SchemaIntrospector};

use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Where a page starts.
#[derive(Debug, Clone, PartialEq)]
enum Start {
    /// First page in key order.
    Head(SortDirection),
    /// After the last key of the previous page.
    After { last: Vec<Value>, direction: SortDirection },
    /// At a row offset.
    Offset(usize),
}

/// What the caller asked for.
enum Origin {
    First,
    Token(String),
    Offset(usize),
}

/// Produces pages of table rows.
pub struct CursorPager {
    registry: Arc<ConnectionRegistry>,
    schema: Arc<SchemaIntrospector>,
    config: PagerConfig,
}

impl CursorPager {
    pub fn new(registry: Arc<ConnectionRegistry>, schema: Arc<SchemaIntrospector>, config: PagerConfig) -> Self {
        Self { registry, schema, config }
    }

    /// First page of the table.
    pub async fn first_page(
        &self,
        profile_id: Uuid,
        table: &TableRef,
        options: PageOptions,
    ) -> Result<Page, QueryError> {
        self.fetch(profile_id, table, Origin::First, options).await
    }

    /// Page following the one that produced `token`.
    ///
    /// Tokens minted for another table or another ordering key are rejected.
    pub async fn next_page(
        &self,
        profile_id: Uuid,
        table: &TableRef,
        token: &str,
        options: PageOptions,
    ) -> Result<Page, QueryError> {
        self.fetch(profile_id, table, Origin::Token(token.to_string()), options).await
    }

    /// Page starting at an explicit row offset.
    ///
    /// Keyed tables are still ordered by their key, and the returned cursor
    /// continues with keyset pages from there.
    pub async fn page_at_offset(
        &self,
        profile_id: Uuid,
        table: &TableRef,
        offset: usize,
        options: PageOptions,
    ) -> Result<Page, QueryError> {
        self.fetch(profile_id, table, Origin::Offset(offset), options).await
    }

    async fn fetch(
        &self,
        profile_id: Uuid,
        table: &TableRef,
        origin: Origin,
        options: PageOptions,
    ) -> Result<Page, QueryError> {
        let engine = self.registry.get(profile_id)?.engine;
        let table_id = cursor_table_id(profile_id, engine, table);
        let details = self.schema.column_details(profile_id, table).await?;
        let key = ordering_key_of(&details);

        let start = match origin {
            Origin::First => Start::Head(options.direction),
            Origin::Offset(offset) => Start::Offset(offset),
            Origin::Token(token) => {
                let cursor = Cursor::decode(&token)?;
                cursor.ensure_table(&table_id)?;
                match cursor.position {
                    CursorPosition::Offset { offset } => Start::Offset(offset),
                    CursorPosition::Keyset { columns, last, direction } => {
                        if key.as_ref() != Some(&columns) || last.len() != columns.len() {
                            return Err(QueryError::InvalidCursor(format!(
                                "cursor key ({}) does not match the ordering key of {table}",
                                columns.join(", ")
                            )));
                        }
                        Start::After { last, direction }
                    }
                }
            }
        };

        let page_size = self.config.effective_page_size(options.page_size);
        let (sql, params) = page_query(engine, table, key.as_deref(), &start, page_size);
        let strategy = match (&start, &key) {
            (Start::Offset(_), _) | (_, None) => PagingStrategy::Offset,
            _ => PagingStrategy::Keyset,
        };

        let pool = self.registry.pool_for(profile_id).await?;
        let started = Instant::now();
        let raw = pool.query(QuerySpec::new(&sql, page_size + 1).with_params(&params)).await?;

        let mut rows = raw.rows;
        let has_more = rows.len() > page_size || raw.more_available;
        rows.truncate(page_size);

        let names: Arc<[String]> = raw.columns.iter().map(|c| c.name.clone()).collect();
        let next_position = if !has_more {
            None
        } else {
            match (&key, &start) {
                (Some(key), _) => {
                    let last_row = rows.last().map(Vec::as_slice).unwrap_or_default();
                    Some(CursorPosition::Keyset {
                        last: key_values(&names, last_row, key)?,
                        columns: key.clone(),
                        direction: direction_of(&start),
                    })
                }
                (None, Start::Offset(offset)) => Some(CursorPosition::Offset { offset: offset + rows.len() }),
                (None, _) => Some(CursorPosition::Offset { offset: rows.len() }),
            }
        };
        let next_cursor = next_position
            .map(|position| Cursor { table: table_id.clone(), position }.encode())
            .transpose()?;

        let total_count = self.count(profile_id, &pool, engine, table, options.count).await?;

        tracing::debug!(
            connection_id = %profile_id,
            table = %table,
            strategy = ?strategy,
            row_count = rows.len(),
            has_more,
            execution_time_ms = started.elapsed().as_millis() as u64,
            "Page fetched"
        );

        Ok(Page {
            columns: page_columns(&details, &raw.columns),
            rows: rows.into_iter().map(|values| Row::new(names.clone(), values)).collect(),
            next_cursor,
            has_more,
            total_count,
            strategy,
        })
    }

    async fn count(
        &self,
        profile_id: Uuid,
        pool: &ProfilePool,
        engine: EngineType,
        table: &TableRef,
        mode: CountMode,
    ) -> Result<Option<i64>, QueryError> {
        match mode {
            CountMode::Skip => return Ok(None),
            CountMode::Approximate => {
                let tables = self.schema.list_tables(profile_id).await?;
                let estimate = tables
                    .iter()
                    .find(|t| t.schema == table.schema && t.name == table.name)
                    .and_then(|t| t.row_count);
                if estimate.is_some() {
                    return Ok(estimate);
                }
                tracing::trace!(table = %table, "No catalog estimate, counting exactly");
            }
            CountMode::Exact => {}
        }

        let sql = format!("SELECT COUNT(*) FROM {}", dialect::qualified_table(engine, table));
        let raw = pool.query(QuerySpec::new(&sql, 1)).await?;
        Ok(raw.rows.first().and_then(|row| row.first()).and_then(count_value))
    }
}

/// Identity a cursor is bound to.
fn cursor_table_id(profile_id: Uuid, engine: EngineType, table: &TableRef) -> String {
    format!("{profile_id}:{}:{}", engine.as_str(), table.qualified())
}

fn direction_of(start: &Start) -> SortDirection {
    match start {
        Start::Head(direction) | Start::After { direction, .. } => *direction,
        Start::Offset(_) => SortDirection::Asc,
    }
}

/// Page statement and its bound parameters.
fn page_query(
    engine: EngineType,
    table: &TableRef,
    key: Option<&[String]>,
    start: &Start,
    page_size: usize,
) -> (String, Vec<Value>) {
    let mut sql = format!("SELECT * FROM {}", dialect::qualified_table(engine, table));
    let mut params = Vec::new();
    let direction = direction_of(start);

    if let Some(key) = key {
        let quoted: Vec<String> = key.iter().map(|c| dialect::quote_ident(engine, c)).collect();

        if let Start::After { last, .. } = start {
            let placeholders: Vec<String> = (1..=key.len()).map(|i| dialect::placeholder(engine, i)).collect();
            let predicate = if key.len() == 1 {
                format!("{} {} {}", quoted[0], direction.operator(), placeholders[0])
            } else {
                format!("({}) {} ({})", quoted.join(", "), direction.operator(), placeholders.join(", "))
            };
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
            params.extend(last.iter().cloned());
        }

        let order: Vec<String> = quoted.iter().map(|c| format!("{c} {}", direction.keyword())).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    sql.push_str(&format!(" LIMIT {}", page_size + 1));
    if let Start::Offset(offset) = start {
        if *offset > 0 {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }
    (sql, params)
}

fn key_values(names: &[String], row: &[Value], key: &[String]) -> Result<Vec<Value>, QueryError> {
    key.iter()
        .map(|column| {
            names
                .iter()
                .position(|name| name == column)
                .and_then(|idx| row.get(idx).cloned())
                .ok_or_else(|| QueryError::rejected(format!("Ordering column {column} missing from page")))
        })
        .collect()
}

/// Catalog metadata when it lines up with the result, else what the engine sent.
fn page_columns(details: &[ColumnDetail], result: &[ColumnMetadata]) -> Vec<ColumnMetadata> {
    let aligned = details.len() == result.len()
        && details.iter().zip(result).all(|(detail, column)| detail.column.name == column.name);
    if aligned || result.is_empty() {
        details.iter().map(|d| d.column.clone()).collect()
    } else {
        result.to_vec()
    }
}

fn count_value(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => Some(*n),
        Value::Text(s) => s.parse().ok(),
        _ => None,
    }
}
