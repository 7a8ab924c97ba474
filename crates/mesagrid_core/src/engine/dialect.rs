//! SQL text differences between engines.

use crate::models::{EngineType, TableRef};

/// Alias given to the subquery when an ad-hoc SELECT is windowed server-side.
const WINDOW_ALIAS: &str = "mesagrid_window";

/// Quote an identifier, doubling any embedded quote character.
pub fn quote_ident(engine: EngineType, name: &str) -> String {
    match engine {
        EngineType::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        EngineType::Mysql => format!("`{}`", name.replace('`', "``")),
    }
}

/// Quoted `schema.table`.
pub fn qualified_table(engine: EngineType, table: &TableRef) -> String {
    format!("{}.{}", quote_ident(engine, &table.schema), quote_ident(engine, &table.name))
}

/// Bind placeholder for the 1-based parameter `index`.
pub fn placeholder(engine: EngineType, index: usize) -> String {
    match engine {
        EngineType::Postgres => format!("${index}"),
        EngineType::Mysql => "?".to_string(),
    }
}

/// Schema browsed when the caller names none.
pub fn default_schema(engine: EngineType, database: &str) -> String {
    match engine {
        EngineType::Postgres => "public".to_string(),
        EngineType::Mysql => database.to_string(),
    }
}

/// Wrap a single SELECT so the server returns at most `limit` rows from `offset`.
///
/// The body is closed on its own line so a trailing `--` comment cannot
/// swallow the wrapper.
pub fn window(sql: &str, limit: usize, offset: usize) -> String {
    let body = strip_terminator(sql);
    if offset == 0 {
        format!("SELECT * FROM ({body}\n) AS {WINDOW_ALIAS} LIMIT {limit}")
    } else {
        format!("SELECT * FROM ({body}\n) AS {WINDOW_ALIAS} LIMIT {limit} OFFSET {offset}")
    }
}

/// Drop trailing semicolons and whitespace.
pub fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Statement that starts a transaction.
pub fn begin(engine: EngineType) -> &'static str {
    match engine {
        EngineType::Postgres => "BEGIN",
        EngineType::Mysql => "START TRANSACTION",
    }
}
