//! Schema browsing, table paging and row editing commands.

use super::parse_id;
use crate::error::ErrorResponse;
use crate::models::{
    ColumnDetail, CountMode, KeyPart, MutationRequest, MutationResult, Page, PageOptions, SortDirection,
    TableDescriptor, TableRef, Value,
};
use crate::state::CoreState;

use serde::Deserialize;
use uuid::Uuid;

/// Input of [`get_table_data`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTableDataRequest {
    /// Profile to read from
    pub connection_id: String,
    /// Table name
    pub table: String,
    /// Schema; defaults per engine
    #[serde(default)]
    pub schema: Option<String>,
    /// Rows per page
    #[serde(default)]
    pub limit: usize,
    /// Start at a row offset instead of the beginning
    #[serde(default)]
    pub offset: Option<usize>,
    /// Token from the previous page
    #[serde(default)]
    pub cursor: Option<String>,
    /// Total count policy
    #[serde(default)]
    pub count: CountMode,
    /// Key order for the first page
    #[serde(default)]
    pub direction: SortDirection,
}

/// One column value of a new row.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnValue {
    /// Column name
    pub column: String,
    /// Value to store
    pub value: Value,
}

/// Input of [`update_cell`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCellRequest {
    pub connection_id: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Primary key of the row
    pub key: Vec<KeyPart>,
    pub column: String,
    pub value: Value,
}

/// Input of [`insert_row`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRowRequest {
    pub connection_id: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Values of the new row; omitted columns take their defaults
    #[serde(default)]
    pub values: Vec<ColumnValue>,
}

/// Input of [`delete_row`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRowRequest {
    pub connection_id: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Primary key of the row
    pub key: Vec<KeyPart>,
}

fn target(
    state: &CoreState,
    connection_id: &str,
    schema: Option<&str>,
    table: &str,
) -> Result<(Uuid, TableRef), ErrorResponse> {
    let id = parse_id(connection_id, "connection")?;
    let table = state.schema().resolve(id, schema, table)?;
    Ok((id, table))
}

/// Tables and views of the profile.
pub async fn list_tables(state: &CoreState, connection_id: &str) -> Result<Vec<TableDescriptor>, ErrorResponse> {
    let id = parse_id(connection_id, "connection")?;
    Ok(state.schema().list_tables(id).await?)
}

/// Columns of one table with key information.
pub async fn get_table_schema(
    state: &CoreState,
    connection_id: &str,
    table: &str,
    schema: Option<&str>,
) -> Result<Vec<ColumnDetail>, ErrorResponse> {
    let (id, table) = target(state, connection_id, schema, table)?;
    Ok(state.schema().columns(id, &table).await?)
}

/// One page of table rows.
///
/// A cursor continues a previous walk; otherwise an offset jumps, and with
/// neither the first page is returned.
pub async fn get_table_data(state: &CoreState, request: GetTableDataRequest) -> Result<Page, ErrorResponse> {
    let (id, table) = target(state, &request.connection_id, request.schema.as_deref(), &request.table)?;
    let options = PageOptions::new(request.limit)
        .with_count(request.count)
        .with_direction(request.direction);

    let pager = state.pager();
    let page = match (request.cursor.as_deref(), request.offset) {
        (Some(cursor), _) => pager.next_page(id, &table, cursor, options).await?,
        (None, Some(offset)) if offset > 0 => pager.page_at_offset(id, &table, offset, options).await?,
        _ => pager.first_page(id, &table, options).await?,
    };
    Ok(page)
}

/// Drop cached catalog data for one profile, or for all when `None`.
pub fn invalidate_schema(state: &CoreState, connection_id: Option<&str>) -> Result<(), ErrorResponse> {
    match connection_id {
        Some(id) => state.schema().invalidate(parse_id(id, "connection")?),
        None => state.schema().invalidate_all(),
    }
    Ok(())
}

/// Set one cell of a row identified by primary key.
pub async fn update_cell(state: &CoreState, request: UpdateCellRequest) -> Result<MutationResult, ErrorResponse> {
    let (id, table) = target(state, &request.connection_id, request.schema.as_deref(), &request.table)?;
    let mutation = MutationRequest::update_cell(id, table, request.key, request.column, request.value);
    Ok(state.mutations().update_cell(&mutation).await?)
}

/// Insert one row.
pub async fn insert_row(state: &CoreState, request: InsertRowRequest) -> Result<MutationResult, ErrorResponse> {
    let (id, table) = target(state, &request.connection_id, request.schema.as_deref(), &request.table)?;
    let values = request.values.into_iter().map(|v| (v.column, v.value)).collect();
    let mutation = MutationRequest::insert(id, table, values);
    Ok(state.mutations().insert_row(&mutation).await?)
}

/// Delete one row identified by primary key.
pub async fn delete_row(state: &CoreState, request: DeleteRowRequest) -> Result<MutationResult, ErrorResponse> {
    let (id, table) = target(state, &request.connection_id, request.schema.as_deref(), &request.table)?;
    let mutation = MutationRequest::delete(id, table, request.key);
    Ok(state.mutations().delete_row(&mutation).await?)
}
