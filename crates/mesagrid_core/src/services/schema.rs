//! Schema introspection service.
//!
//! Queries the engine catalogs (`pg_catalog` on PostgreSQL,
//! `information_schema` on MySQL) for tables, views and columns. Results are
//! cached per profile in an immutable snapshot that is replaced, never edited,
//! and dropped when the profile reconnects or is invalidated.

use crate::engine::{dialect, QuerySpec};
use crate::error::{ConnectionError, QueryError};
use crate::models::{
    ColumnDetail, ColumnMetadata, EngineType, TableDescriptor, TableKind, TableRef, Value,
};
use crate::services::pool::ProfilePool;
use crate::services::registry::ConnectionRegistry;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const PG_TABLES: &str = r#"
    SELECT
        n.nspname::text AS schema,
        c.relname::text AS name,
        c.relkind::text AS kind,
        c.reltuples::bigint AS estimated_rows
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p', 'v', 'm')
      AND n.nspname NOT LIKE 'pg_%'
      AND n.nspname != 'information_schema'
    ORDER BY n.nspname, c.relname
"#;

const PG_COLUMNS: &str = r#"
    SELECT
        a.attname::text AS name,
        pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
        NOT a.attnotnull AS is_nullable,
        pg_get_expr(d.adbin, d.adrelid) AS default_value,
        a.attnum::integer AS ordinal_position,
        COALESCE(
            (SELECT TRUE FROM pg_catalog.pg_index i
             WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
             LIMIT 1),
            FALSE
        ) AS is_primary_key,
        COALESCE(
            (SELECT TRUE FROM pg_catalog.pg_index i
             WHERE i.indrelid = c.oid AND i.indisunique AND i.indnatts = 1
               AND i.indkey[0] = a.attnum AND i.indpred IS NULL
             LIMIT 1),
            FALSE
        ) AS is_unique
    FROM pg_catalog.pg_attribute a
    JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
    WHERE n.nspname::text = $1
      AND c.relname::text = $2
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

const MYSQL_TABLES: &str = r#"
    SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE, TABLE_ROWS
    FROM information_schema.TABLES
    WHERE TABLE_SCHEMA = ?
    ORDER BY TABLE_NAME
"#;

const MYSQL_COLUMNS: &str = r#"
    SELECT
        COLUMN_NAME,
        COLUMN_TYPE,
        IS_NULLABLE = 'YES',
        COLUMN_DEFAULT,
        ORDINAL_POSITION,
        COLUMN_KEY = 'PRI',
        COLUMN_KEY IN ('PRI', 'UNI')
    FROM information_schema.COLUMNS
    WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION
"#;

/// Immutable cached catalog data for one pool generation.
#[derive(Debug, Clone)]
struct Snapshot {
    generation: u64,
    loaded_at: Instant,
    tables: Option<Arc<Vec<TableDescriptor>>>,
    columns: HashMap<TableRef, Arc<Vec<ColumnDetail>>>,
}

impl Snapshot {
    fn empty(generation: u64) -> Self {
        Self { generation, loaded_at: Instant::now(), tables: None, columns: HashMap::new() }
    }
}

/// Catalog reader with a per-profile cache.
///
/// Readers hold the map lock only to clone a snapshot's `Arc`. A refresh
/// builds a new snapshot and swaps it in, so a reader keeps the one it took.
pub struct SchemaIntrospector {
    registry: Arc<ConnectionRegistry>,
    cache: RwLock<HashMap<Uuid, Arc<Snapshot>>>,
    ttl: Option<Duration>,
}

impl SchemaIntrospector {
    /// Create an introspector. `ttl` of `None` caches until invalidated.
    pub fn new(registry: Arc<ConnectionRegistry>, ttl: Option<Duration>) -> Self {
        Self { registry, cache: RwLock::new(HashMap::new()), ttl }
    }

    /// Tables and views visible to the profile.
    pub async fn list_tables(&self, profile_id: Uuid) -> Result<Vec<TableDescriptor>, QueryError> {
        let pool = self.registry.pool_for(profile_id).await?;
        if let Some(tables) = self.snapshot(profile_id, &pool).and_then(|s| s.tables.clone()) {
            tracing::trace!(connection_id = %profile_id, "Table list served from cache");
            return Ok(tables.as_ref().clone());
        }

        let profile = self.registry.get(profile_id)?;
        let result = match pool.engine() {
            EngineType::Postgres => pool.query(QuerySpec::new(PG_TABLES, usize::MAX)).await?,
            EngineType::Mysql => {
                let params = [Value::Text(profile.database.clone())];
                pool.query(QuerySpec::new(MYSQL_TABLES, usize::MAX).with_params(&params)).await?
            }
        };
        let tables: Vec<TableDescriptor> = result.rows.iter().filter_map(|row| table_from_row(row)).collect();

        tracing::debug!(connection_id = %profile_id, count = tables.len(), "Tables loaded");
        let shared = Arc::new(tables.clone());
        self.update(profile_id, &pool, |snapshot| snapshot.tables = Some(shared));
        Ok(tables)
    }

    /// Columns of one table or view in ordinal order.
    pub async fn columns(&self, profile_id: Uuid, table: &TableRef) -> Result<Vec<ColumnDetail>, QueryError> {
        self.column_details(profile_id, table).await.map(|cols| cols.as_ref().clone())
    }

    /// Column metadata without key information.
    pub async fn column_metadata(
        &self,
        profile_id: Uuid,
        table: &TableRef,
    ) -> Result<Vec<ColumnMetadata>, QueryError> {
        let details = self.column_details(profile_id, table).await?;
        Ok(details.iter().map(|d| d.column.clone()).collect())
    }

    pub(crate) async fn column_details(
        &self,
        profile_id: Uuid,
        table: &TableRef,
    ) -> Result<Arc<Vec<ColumnDetail>>, QueryError> {
        let pool = self.registry.pool_for(profile_id).await?;
        if let Some(columns) = self.snapshot(profile_id, &pool).and_then(|s| s.columns.get(table).cloned()) {
            return Ok(columns);
        }

        let params = [Value::Text(table.schema.clone()), Value::Text(table.name.clone())];
        let sql = match pool.engine() {
            EngineType::Postgres => PG_COLUMNS,
            EngineType::Mysql => MYSQL_COLUMNS,
        };
        let result = pool.query(QuerySpec::new(sql, usize::MAX).with_params(&params)).await?;
        let columns: Vec<ColumnDetail> = result.rows.iter().filter_map(|row| column_from_row(row)).collect();
        if columns.is_empty() {
            return Err(QueryError::rejected(format!("Table {table} does not exist")));
        }

        tracing::debug!(connection_id = %profile_id, table = %table, count = columns.len(), "Columns loaded");
        let columns = Arc::new(columns);
        let cached = columns.clone();
        let key = table.clone();
        self.update(profile_id, &pool, move |snapshot| {
            snapshot.columns.insert(key, cached);
        });
        Ok(columns)
    }

    /// Primary key columns, empty when the table has none.
    pub async fn primary_key(&self, profile_id: Uuid, table: &TableRef) -> Result<Vec<String>, QueryError> {
        let columns = self.column_details(profile_id, table).await?;
        Ok(primary_key_of(&columns))
    }

    /// Columns giving a stable row order: the primary key, else one
    /// non-nullable unique column. `None` when neither exists.
    pub async fn ordering_key(
        &self,
        profile_id: Uuid,
        table: &TableRef,
    ) -> Result<Option<Vec<String>>, QueryError> {
        let columns = self.column_details(profile_id, table).await?;
        Ok(ordering_key_of(&columns))
    }

    /// Resolve an optional schema to the engine default for the profile.
    pub fn resolve(
        &self,
        profile_id: Uuid,
        schema: Option<&str>,
        table: &str,
    ) -> Result<TableRef, ConnectionError> {
        let profile = self.registry.get(profile_id)?;
        let schema = match schema.map(str::trim).filter(|s| !s.is_empty()) {
            Some(schema) => schema.to_string(),
            None => dialect::default_schema(profile.engine, &profile.database),
        };
        Ok(TableRef::new(schema, table))
    }

    /// Drop everything cached for the profile.
    pub fn invalidate(&self, profile_id: Uuid) {
        if self.cache.write().remove(&profile_id).is_some() {
            tracing::debug!(connection_id = %profile_id, "Schema cache invalidated");
        }
    }

    /// Drop every profile's cache.
    pub fn invalidate_all(&self) {
        self.cache.write().clear();
    }

    fn is_fresh(&self, snapshot: &Snapshot, generation: u64) -> bool {
        snapshot.generation == generation
            && self.ttl.map_or(true, |ttl| snapshot.loaded_at.elapsed() < ttl)
    }

    fn snapshot(&self, profile_id: Uuid, pool: &ProfilePool) -> Option<Arc<Snapshot>> {
        let snapshot = self.cache.read().get(&profile_id).cloned()?;
        self.is_fresh(&snapshot, pool.generation()).then_some(snapshot)
    }

    /// Swap in a copy of the current snapshot with `apply` run on it.
    fn update(&self, profile_id: Uuid, pool: &ProfilePool, apply: impl FnOnce(&mut Snapshot)) {
        let mut cache = self.cache.write();
        let mut next = match cache.get(&profile_id) {
            Some(current) if self.is_fresh(current, pool.generation()) => current.as_ref().clone(),
            _ => Snapshot::empty(pool.generation()),
        };
        apply(&mut next);
        cache.insert(profile_id, Arc::new(next));
    }
}

pub(crate) fn primary_key_of(columns: &[ColumnDetail]) -> Vec<String> {
    columns.iter().filter(|c| c.is_primary_key).map(|c| c.name().to_string()).collect()
}

pub(crate) fn ordering_key_of(columns: &[ColumnDetail]) -> Option<Vec<String>> {
    let pk = primary_key_of(columns);
    if !pk.is_empty() {
        return Some(pk);
    }
    columns
        .iter()
        .find(|c| c.is_unique && !c.column.nullable)
        .map(|c| vec![c.name().to_string()])
}

fn table_from_row(row: &[Value]) -> Option<TableDescriptor> {
    let schema = text(row.first()?)?;
    let name = text(row.get(1)?)?;
    let kind = match text(row.get(2)?)?.as_str() {
        "r" | "p" | "BASE TABLE" => TableKind::Table,
        "v" | "m" | "VIEW" | "SYSTEM VIEW" => TableKind::View,
        _ => return None,
    };
    let row_count = row.get(3).and_then(integer).filter(|n| *n >= 0);
    Some(TableDescriptor { schema, name, kind, row_count })
}

fn column_from_row(row: &[Value]) -> Option<ColumnDetail> {
    let name = text(row.first()?)?;
    let data_type = text(row.get(1)?)?;
    let nullable = flag(row.get(2)?);
    Some(ColumnDetail {
        column: ColumnMetadata::new(name, data_type, nullable),
        default_value: row.get(3).and_then(text),
        ordinal_position: row.get(4).and_then(integer).unwrap_or_default() as i32,
        is_primary_key: row.get(5).is_some_and(flag),
        is_unique: row.get(6).is_some_and(flag),
    })
}

// Catalog columns arrive with engine-specific types: MySQL reports booleans
// as integers and may send names as binary strings.

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
        Value::Integer(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => Some(*n),
        Value::Float(f) => Some(*f as i64),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(value: &Value) -> bool {
    match value {
        Value::Boolean(b) => *b,
        Value::Integer(n) => *n != 0,
        Value::Text(s) => matches!(s.as_str(), "1" | "t" | "true" | "YES"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::models::{ProfileDraft, Secret};
    use crate::services::pool::PoolManager;
    use crate::services::storage::LocalStorage;
    use crate::test_support::{catalog_reply, column_row, session_vault, users_table, FakeConnector, Reply};

    fn setup(connector: &FakeConnector, engine: EngineType) -> (Arc<ConnectionRegistry>, Uuid) {
        let vault = session_vault();
        let pools = Arc::new(PoolManager::new(Arc::new(connector.clone()), vault.clone(), PoolConfig::default()));
        let registry = Arc::new(ConnectionRegistry::new(LocalStorage::open_in_memory().unwrap(), vault, pools));
        let profile = registry
            .create(ProfileDraft::new("Shop", engine, "db", "shop", "app"), &Secret::new("pw"))
            .unwrap();
        (registry, profile.id)
    }

    fn catalog_queries(connector: &FakeConnector) -> usize {
        connector.statements().iter().filter(|s| s.contains("pg_catalog")).count()
    }

    #[tokio::test]
    async fn test_list_tables_is_cached_until_invalidated() {
        let connector = FakeConnector::with_handler(EngineType::Postgres, users_table(5));
        let (registry, id) = setup(&connector, EngineType::Postgres);
        let schema = SchemaIntrospector::new(registry, None);

        let tables = schema.list_tables(id).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].kind, TableKind::Table);
        assert_eq!(tables[0].row_count, Some(5));

        schema.list_tables(id).await.unwrap();
        assert_eq!(catalog_queries(&connector), 1);

        schema.invalidate(id);
        schema.list_tables(id).await.unwrap();
        assert_eq!(catalog_queries(&connector), 2);
    }

    #[tokio::test]
    async fn test_refresh_swaps_snapshot_without_touching_readers() {
        let connector = FakeConnector::with_handler(EngineType::Postgres, users_table(3));
        let (registry, id) = setup(&connector, EngineType::Postgres);
        let schema = SchemaIntrospector::new(registry.clone(), None);
        let pool = registry.pool_for(id).await.unwrap();
        let users = TableRef::new("public", "users");

        schema.list_tables(id).await.unwrap();
        let before = schema.snapshot(id, &pool).unwrap();
        assert!(before.columns.is_empty());

        schema.columns(id, &users).await.unwrap();
        let after = schema.snapshot(id, &pool).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before.columns.is_empty());
        assert!(after.columns.contains_key(&users));
        assert!(after.tables.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_discards_cache() {
        let connector = FakeConnector::with_handler(EngineType::Postgres, users_table(3));
        let (registry, id) = setup(&connector, EngineType::Postgres);
        let schema = SchemaIntrospector::new(registry.clone(), None);
        let users = TableRef::new("public", "users");

        schema.columns(id, &users).await.unwrap();
        registry.disconnect(id).unwrap();
        schema.columns(id, &users).await.unwrap();
        assert_eq!(catalog_queries(&connector), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_reloads() {
        let connector = FakeConnector::with_handler(EngineType::Postgres, users_table(3));
        let (registry, id) = setup(&connector, EngineType::Postgres);
        let schema = SchemaIntrospector::new(registry, Some(Duration::ZERO));

        schema.list_tables(id).await.unwrap();
        schema.list_tables(id).await.unwrap();
        assert_eq!(catalog_queries(&connector), 2);
    }

    #[tokio::test]
    async fn test_columns_and_keys() {
        let connector = FakeConnector::with_handler(EngineType::Postgres, users_table(3));
        let (registry, id) = setup(&connector, EngineType::Postgres);
        let schema = SchemaIntrospector::new(registry, None);
        let users = TableRef::new("public", "users");

        let columns = schema.columns(id, &users).await.unwrap();
        assert_eq!(columns.iter().map(ColumnDetail::name).collect::<Vec<_>>(), ["id", "name"]);
        assert!(!columns[0].column.nullable);
        assert_eq!(schema.primary_key(id, &users).await.unwrap(), ["id"]);
        assert_eq!(schema.ordering_key(id, &users).await.unwrap(), Some(vec!["id".to_string()]));

        let (sql, params) = connector.statements_with_params().pop().unwrap();
        assert!(sql.contains("pg_attribute"));
        assert_eq!(params, vec![Value::from("public"), Value::from("users")]);
    }

    #[tokio::test]
    async fn test_mysql_integer_flags_and_unique_fallback() {
        let connector = FakeConnector::with_handler(EngineType::Mysql, |sql, _| {
            if sql.contains("information_schema.COLUMNS") {
                catalog_reply(vec![
                    vec!["code".into(), "varchar(8)".into(), Value::Integer(0), Value::Null, Value::Integer(1), Value::Integer(0), Value::Integer(1)],
                    vec!["label".into(), "text".into(), Value::Integer(1), Value::Null, Value::Integer(2), Value::Integer(0), Value::Integer(0)],
                ])
            } else {
                Reply::Affected(0)
            }
        });
        let (registry, id) = setup(&connector, EngineType::Mysql);
        let schema = SchemaIntrospector::new(registry, None);
        let table = schema.resolve(id, None, "codes").unwrap();
        assert_eq!(table.schema, "shop");

        assert!(schema.primary_key(id, &table).await.unwrap().is_empty());
        assert_eq!(schema.ordering_key(id, &table).await.unwrap(), Some(vec!["code".to_string()]));
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected() {
        let connector = FakeConnector::with_handler(EngineType::Postgres, |_, _| catalog_reply(Vec::new()));
        let (registry, id) = setup(&connector, EngineType::Postgres);
        let schema = SchemaIntrospector::new(registry, None);

        let err = schema.columns(id, &TableRef::new("public", "missing")).await.unwrap_err();
        assert_eq!(err.kind(), "Rejected");
    }

    #[test]
    fn test_ordering_key_requires_non_null_unique() {
        let nullable_unique = ColumnDetail {
            column: ColumnMetadata::new("email", "text", true),
            is_primary_key: false,
            is_unique: true,
            default_value: None,
            ordinal_position: 1,
        };
        assert_eq!(ordering_key_of(&[nullable_unique]), None);

        let rows = vec![column_row("a", "int", false, true, false, 1), column_row("b", "int", false, true, false, 2)];
        let columns: Vec<_> = rows.iter().filter_map(|r| column_from_row(r)).collect();
        assert_eq!(ordering_key_of(&columns), Some(vec!["a".to_string(), "b".to_string()]));
    }
}
