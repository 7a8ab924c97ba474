//! End-to-end checks of the core's guarantees through the command surface.
//!
//! Every test drives [`CoreState`](crate::state::CoreState) over the scripted
//! engine, so pool, executor, pager, introspector and mutation behavior are
//! exercised together:
//! - keyset pages partition a full scan
//! - ad-hoc results are always row-bounded
//! - cancellation returns within the grace bound and releases the connection
//! - destructive statements need confirmation
//! - keyless tables refuse edits
//! - connection testing never fails and never creates a pool
//! - deleting a profile removes its password

#[cfg(test)]
mod tests {
    use crate::commands::{self, CreateConnectionRequest, ExecuteQueryRequest, GetTableDataRequest, UpdateCellRequest};
    use crate::engine::EngineError;
    use crate::error::VaultError;
    use crate::models::{CountMode, DestructiveKind, EngineType, KeyPart, Page, QueryResult, SortDirection, Value};
    use crate::services::CredentialVault;
    use crate::state::CoreState;
    use crate::test_support::{
        catalog_reply, column_row, fast_config, session_vault, users_table, FakeConnector, Reply,
    };

    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    struct Fixture {
        state: Arc<CoreState>,
        connector: FakeConnector,
        vault: Arc<CredentialVault>,
        profile: String,
    }

    fn fixture(handler: impl Fn(&str, &[Value]) -> Reply + Send + Sync + 'static) -> Fixture {
        let connector = FakeConnector::with_handler(EngineType::Postgres, handler);
        let vault = session_vault();
        let state = Arc::new(CoreState::in_memory(fast_config(), vault.clone(), Arc::new(connector.clone())));
        let request: CreateConnectionRequest = serde_json::from_value(serde_json::json!({
            "name": "P",
            "type": "postgres",
            "host": "db.internal",
            "port": 5432,
            "database": "app",
            "username": "app",
            "password": "hunter2"
        }))
        .unwrap();
        let profile = commands::create_connection(&state, request).unwrap();
        Fixture { state, connector, vault, profile }
    }

    fn page_request(profile: &str, limit: usize, cursor: Option<String>) -> GetTableDataRequest {
        GetTableDataRequest {
            connection_id: profile.to_string(),
            table: "users".into(),
            schema: None,
            limit,
            offset: None,
            cursor,
            count: CountMode::Skip,
            direction: SortDirection::Asc,
        }
    }

    fn query(profile: &str, sql: &str) -> ExecuteQueryRequest {
        ExecuteQueryRequest {
            connection_id: profile.to_string(),
            sql: sql.to_string(),
            limit: None,
            offset: None,
            confirmed: false,
            query_id: None,
        }
    }

    fn ids(rows: &[crate::models::Row]) -> Vec<i64> {
        rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect()
    }

    fn page_ids(page: &Page) -> Vec<i64> {
        ids(&page.rows)
    }

    fn result_ids(result: &QueryResult) -> Vec<i64> {
        ids(&result.rows)
    }

    // =========================================================================
    // Keyset pagination
    // =========================================================================

    #[tokio::test]
    async fn test_keyset_pages_partition_full_scan() {
        let f = fixture(users_table(11));

        let mut walked = Vec::new();
        let mut cursor = None;
        loop {
            let page = commands::get_table_data(&f.state, page_request(&f.profile, 3, cursor)).await.unwrap();
            let batch = page_ids(&page);
            assert!(batch.len() <= 3);
            assert!(batch.iter().all(|id| !walked.contains(id)), "pages overlap: {batch:?}");
            walked.extend(batch);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut scan = query(&f.profile, "SELECT * FROM \"public\".\"users\" ORDER BY id");
        scan.limit = Some(1_000);
        let full = commands::execute_query(&f.state, scan).await.unwrap();
        assert_eq!(walked, result_ids(&full));
    }

    #[tokio::test]
    async fn test_five_rows_in_pages_of_two() {
        let f = fixture(users_table(5));

        let first = commands::get_table_data(&f.state, page_request(&f.profile, 2, None)).await.unwrap();
        assert_eq!(page_ids(&first), vec![1, 2]);
        assert!(first.has_more);
        let c1 = first.next_cursor.clone().unwrap();

        let second = commands::get_table_data(&f.state, page_request(&f.profile, 2, Some(c1))).await.unwrap();
        assert_eq!(page_ids(&second), vec![3, 4]);
        assert!(second.has_more);
        let c2 = second.next_cursor.clone().unwrap();

        let third = commands::get_table_data(&f.state, page_request(&f.profile, 2, Some(c2))).await.unwrap();
        assert_eq!(page_ids(&third), vec![5]);
        assert!(!third.has_more);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_total_count_is_a_separate_query() {
        let f = fixture(users_table(5));
        let mut request = page_request(&f.profile, 2, None);
        request.count = CountMode::Exact;
        let page = commands::get_table_data(&f.state, request).await.unwrap();
        assert_eq!(page.total_count, Some(5));
        assert_eq!(page.rows.len(), 2);
    }

    // =========================================================================
    // Row bounds
    // =========================================================================

    #[tokio::test]
    async fn test_query_never_exceeds_limit() {
        let f = fixture(|_, _| {
            Reply::rows(&["id"], (1..=5_000).map(|i| vec![Value::Integer(i)]).collect())
        });

        let unbounded = commands::execute_query(&f.state, query(&f.profile, "SELECT id FROM events")).await.unwrap();
        assert_eq!(unbounded.row_count, f.state.config().query.default_row_limit);
        assert!(unbounded.truncated);

        for limit in [1, 7, 250] {
            let mut request = query(&f.profile, "SELECT id FROM events");
            request.limit = Some(limit);
            let result = commands::execute_query(&f.state, request).await.unwrap();
            assert!(result.rows.len() <= limit);
            assert_eq!(result.row_count, result.rows.len());
        }

        let mut huge = query(&f.profile, "SELECT id FROM events");
        huge.limit = Some(1_000_000);
        let result = commands::execute_query(&f.state, huge).await.unwrap();
        assert!(result.rows.len() <= f.state.config().query.max_row_limit);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_returns_within_grace_and_releases_connection() {
        let f = fixture(|sql, params| {
            if sql.contains("pg_sleep") {
                Reply::Hang
            } else {
                users_table(3)(sql, params)
            }
        });
        let status = commands::connect(&f.state, &f.profile).await.unwrap();
        let borrowed_before = status.borrowed;

        let query_id = Uuid::new_v4().to_string();
        let mut request = query(&f.profile, "SELECT pg_sleep(600)");
        request.query_id = Some(query_id.clone());

        let state = f.state.clone();
        let task = tokio::spawn(async move { commands::execute_query(&state, request).await });
        while commands::active_queries(&f.state, Some(&f.profile)).unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        commands::cancel_query(&f.state, &query_id).unwrap();
        let err = task.await.unwrap().unwrap_err();
        let grace = Duration::from_millis(f.state.config().query.cancel_grace_ms);

        assert_eq!(err.kind, "Cancelled");
        assert!(started.elapsed() <= grace + Duration::from_millis(100));
        let after = commands::pool_status(&f.state, &f.profile).unwrap().unwrap();
        assert_eq!(after.borrowed, borrowed_before);

        // Finished queries cancel as a no-op.
        commands::cancel_query(&f.state, &query_id).unwrap();
        let next = commands::execute_query(&f.state, query(&f.profile, "SELECT 1")).await;
        assert!(next.is_ok());
    }

    // =========================================================================
    // Destructive statements
    // =========================================================================

    #[tokio::test]
    async fn test_drop_table_requires_confirmation() {
        let f = fixture(|_, _| Reply::Affected(0));
        let sql = "-- cleanup\n/* old data */ DROP TABLE users";

        let err = commands::execute_query(&f.state, query(&f.profile, sql)).await.unwrap_err();
        assert_eq!(err.kind, "ConfirmationRequired");
        assert_eq!(err.category, "Query");
        assert!(f.connector.statements().is_empty());
        assert_eq!(
            commands::classify_statement(&f.state, &f.profile, sql).unwrap(),
            crate::models::Classification::Destructive(DestructiveKind::Drop)
        );

        let mut confirmed = query(&f.profile, sql);
        confirmed.confirmed = true;
        commands::execute_query(&f.state, confirmed).await.unwrap();
        assert!(f.connector.statements().iter().any(|s| s.contains("DROP TABLE users")));
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    #[tokio::test]
    async fn test_update_cell_without_primary_key_never_applies() {
        let f = fixture(|sql, _| {
            if sql.contains("pg_catalog.pg_attribute") {
                catalog_reply(vec![
                    column_row("ts", "timestamptz", false, false, false, 1),
                    column_row("message", "text", true, false, false, 2),
                ])
            } else {
                Reply::Affected(1)
            }
        });

        for key in [vec![], vec![KeyPart::new("ts", "2024-01-01")]] {
            let request = UpdateCellRequest {
                connection_id: f.profile.clone(),
                table: "audit_log".into(),
                schema: Some("public".into()),
                key,
                column: "message".into(),
                value: Value::Text("redacted".into()),
            };
            let err = commands::update_cell(&f.state, request).await.unwrap_err();
            assert_eq!(err.kind, "NoPrimaryKey");
        }
        assert!(!f.connector.statements().iter().any(|s| s.starts_with("UPDATE") || s == "BEGIN"));
    }

    // =========================================================================
    // Connection testing and lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_unreachable_host_test_reports_without_pool() {
        let f = fixture(users_table(1));
        f.connector.fail_next_connect(EngineError::Unreachable("connection refused".into()));

        let draft = f.state.registry().list()[0].draft();
        let result = commands::test_connection(&f.state, draft, "hunter2".into()).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unreachable"));
        assert!(commands::pool_statuses(&f.state).is_empty());
        assert_eq!(commands::list_connections(&f.state).len(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let f = fixture(users_table(1));
        f.connector.fail_next_connect(EngineError::Auth("password authentication failed".into()));
        f.connector.fail_next_connect(EngineError::Auth("password authentication failed".into()));

        let err = commands::connect(&f.state, &f.profile).await.unwrap_err();
        assert_eq!(err.kind, "AuthFailed");
        assert_eq!(f.connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_vault_secret() {
        let f = fixture(users_table(1));
        commands::connect(&f.state, &f.profile).await.unwrap();
        let id = Uuid::parse_str(&f.profile).unwrap();
        assert!(f.vault.exists(id).unwrap());

        commands::delete_connection(&f.state, &f.profile).unwrap();

        assert_eq!(f.vault.retrieve(id), Err(VaultError::NotFound(id)));
        assert!(commands::list_connections(&f.state).is_empty());
        assert!(commands::pool_status(&f.state, &f.profile).unwrap().is_none());
        assert_eq!(commands::get_connection(&f.state, &f.profile).unwrap_err().kind, "ProfileNotFound");
    }

    #[tokio::test]
    async fn test_profiles_never_carry_the_password() {
        let f = fixture(users_table(1));
        commands::connect(&f.state, &f.profile).await.unwrap();

        let listed = serde_json::to_string(&commands::list_connections(&f.state)).unwrap();
        assert!(!listed.contains("hunter2"));
        assert!(!listed.to_lowercase().contains("password"));
    }

    #[tokio::test]
    async fn test_errors_cross_the_boundary_structured() {
        let f = fixture(|_, _| Reply::Fail(EngineError::Rejected {
            message: "syntax error at or near \"SELEC\"".into(),
            code: Some("42601".into()),
        }));

        let err = commands::execute_query(&f.state, query(&f.profile, "SELEC 1")).await.unwrap_err();
        assert_eq!(err.category, "Query");
        assert_eq!(err.kind, "Rejected");
        assert_eq!(err.code.as_deref(), Some("42601"));
        assert!(err.message.contains("SELEC"));
        assert_eq!(f.connector.statements().len(), 1);

        let err = commands::connect(&f.state, "nope").await.unwrap_err();
        assert_eq!(err.kind, "Validation");
    }
}
