//! End-to-end verification of the gateway.
//!
//! These tests drive `SluiceState` against a recording in-memory engine and
//! check the guarantees callers rely on:
//! - A successful query writes exactly one log entry; a failed one writes none
//! - Tunnel failures surface after the retry budget with the attempt count
//! - Denied mutations never reach the engine
//! - Roles and grants are re-derived on every call
//! - History pages cover the log without gaps or overlap, scoped by role
//! - Reads retry once on connectivity loss; mutations never retry
//! - No secret appears in debug output or error info

#[cfg(test)]
mod tests {
    use crate::config::CoreConfig;
    use crate::error::{SluiceError, SluiceResult};
    use crate::models::{
        ColumnDetail, ColumnInfo, ColumnValues, CredentialSet, DataModel, DataPage, DataRequest,
        DataRow, DatabaseType, NewConnection, ProjectMember, QueryHandle, QueryOptions,
        QueryResult, QueryType, Role, RowId, SecretString, SshSettings,
    };
    use crate::services::engine::{ConnectTarget, EngineRegistry, QueryEngine};
    use crate::services::tunnel::tests::{closed_port, fast_config, TEST_KEY};
    use crate::services::Vault;
    use crate::state::SluiceState;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    // =========================================================================
    // Recording engine
    // =========================================================================

    /// One call observed by the engine.
    #[derive(Debug, Clone)]
    struct Call {
        op: &'static str,
        username: String,
        host: String,
        read_only: Option<bool>,
    }

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<Call>>,
        /// Calls that fail with a lost connection before succeeding.
        connection_failures: AtomicU32,
    }

    impl RecordingEngine {
        fn record(&self, op: &'static str, target: &ConnectTarget, read_only: Option<bool>) -> SluiceResult<()> {
            self.calls.lock().push(Call {
                op,
                username: target.username.expose().to_string(),
                host: target.host.clone(),
                read_only,
            });
            let remaining = self.connection_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connection_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SluiceError::connection("server closed the connection unexpectedly"));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn model() -> DataModel {
            DataModel {
                schema: "public".into(),
                name: "orders".into(),
                owner: "postgres".into(),
                estimated_rows: 3,
                columns: vec![ColumnDetail {
                    name: "id".into(),
                    data_type: "integer".into(),
                    base_type: "integer".into(),
                    is_nullable: false,
                    is_primary_key: true,
                    default_value: None,
                    ordinal_position: 1,
                }],
            }
        }

        fn row() -> DataRow {
            DataRow { row_id: RowId::new("(0,1)"), values: vec![json!(1)] }
        }
    }

    #[async_trait]
    impl QueryEngine for RecordingEngine {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Postgres
        }

        async fn run_query(
            &self,
            target: &ConnectTarget,
            sql: &str,
            options: QueryOptions,
            handle: &QueryHandle,
        ) -> SluiceResult<QueryResult> {
            self.record("run_query", target, Some(options.read_only))?;
            if sql.contains("pg_sleep") {
                handle.cancelled().await;
                return Err(SluiceError::query_cancelled(handle.id()));
            }
            if sql.starts_with("BROKEN") {
                return Err(SluiceError::query(
                    "syntax error at or near \"BROKEN\"",
                    None,
                    None,
                    Some(1),
                    Some("42601".to_string()),
                ));
            }
            Ok(QueryResult {
                query_id: handle.id(),
                columns: vec![ColumnInfo { name: "?column?".into(), type_oid: 23, type_name: "int4".into() }],
                rows: vec![vec![json!(1)]],
                rows_affected: None,
                truncated: false,
                execution_time_ms: 1,
                query_type: QueryType::detect(sql),
            })
        }

        async fn list_data_models(&self, target: &ConnectTarget) -> SluiceResult<Vec<DataModel>> {
            self.record("list_data_models", target, None)?;
            Ok(vec![Self::model()])
        }

        async fn get_single_data_model(
            &self,
            target: &ConnectTarget,
            _schema: &str,
            _table: &str,
        ) -> SluiceResult<DataModel> {
            self.record("get_single_data_model", target, None)?;
            Ok(Self::model())
        }

        async fn get_data(
            &self,
            target: &ConnectTarget,
            _request: &DataRequest,
            _max_page_rows: i64,
        ) -> SluiceResult<DataPage> {
            self.record("get_data", target, None)?;
            Ok(DataPage { columns: vec!["id".into()], rows: vec![Self::row()], total_count: Some(1) })
        }

        async fn add_data(
            &self,
            target: &ConnectTarget,
            _schema: &str,
            _table: &str,
            _values: &ColumnValues,
        ) -> SluiceResult<DataRow> {
            self.record("add_data", target, None)?;
            Ok(Self::row())
        }

        async fn delete_data(
            &self,
            target: &ConnectTarget,
            _schema: &str,
            _table: &str,
            row_ids: &[RowId],
        ) -> SluiceResult<u64> {
            self.record("delete_data", target, None)?;
            Ok(row_ids.len() as u64)
        }

        async fn update_single_data(
            &self,
            target: &ConnectTarget,
            _schema: &str,
            _table: &str,
            _row_id: &RowId,
            _column: &str,
            _value: &serde_json::Value,
        ) -> SluiceResult<DataRow> {
            self.record("update_single_data", target, None)?;
            Ok(Self::row())
        }
    }

    // =========================================================================
    // Fixture
    // =========================================================================

    struct Fixture {
        _dir: TempDir,
        state: SluiceState,
        engine: Arc<RecordingEngine>,
        project: Uuid,
        admin: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let config = CoreConfig {
                data_dir: dir.path().to_path_buf(),
                encryption_key: Some(Vault::generate_key()),
                tunnel: fast_config(2),
                ..CoreConfig::default()
            };
            let engine = Arc::new(RecordingEngine::default());
            let mut engines = EngineRegistry::default();
            engines.register(engine.clone());
            let state = SluiceState::with_engines(config, engines, None).unwrap();

            let project = Uuid::new_v4();
            let admin = Uuid::new_v4();
            let fixture = Self { _dir: dir, state, engine, project, admin };
            fixture.set_role(admin, Role::Admin);
            fixture
        }

        fn set_role(&self, user: Uuid, role: Role) {
            self.state
                .storage()
                .set_project_member(&ProjectMember { user_id: user, project_id: self.project, role })
                .unwrap();
        }

        fn member(&self, role: Role) -> Uuid {
            let user = Uuid::new_v4();
            self.set_role(user, role);
            user
        }

        fn new_connection(&self, login_mode: &str) -> NewConnection {
            NewConnection {
                project_id: self.project,
                name: "orders-db".into(),
                db_type: "POSTGRES".into(),
                host: "orders.internal".into(),
                port: "5432".into(),
                database: "orders".into(),
                root_user: "postgres".into(),
                root_password: "root-secret".into(),
                login_mode: login_mode.into(),
                ssh_mode: "NONE".into(),
                ssh: SshSettings::default(),
            }
        }

        fn connection(&self, login_mode: &str) -> Uuid {
            self.state.gateway().create_connection(self.admin, self.new_connection(login_mode)).unwrap().id
        }

        /// A ROLE_ACCOUNTS connection where `user` is granted the set for `role`.
        fn role_account(&self, user: Uuid, role: Role, db_user: &str) -> Uuid {
            let connection_id = self.connection("ROLE_ACCOUNTS");
            self.state
                .gateway()
                .save_credential_set(
                    self.admin,
                    CredentialSet::for_role(
                        connection_id,
                        role,
                        SecretString::from(db_user),
                        SecretString::from("role-secret"),
                        vec![user],
                    ),
                )
                .unwrap();
            connection_id
        }

        fn history_len(&self, connection_id: Uuid) -> usize {
            self.state.gateway().get_query_history(self.admin, connection_id, None).unwrap().entries.len()
        }
    }

    // =========================================================================
    // Query execution and audit
    // =========================================================================

    #[tokio::test]
    async fn test_role_account_select_logs_exactly_once() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let connection_id = f.role_account(developer, Role::Developer, "app_rw");

        let result = f.state.run_query(developer, connection_id, "SELECT 1").await.unwrap();
        assert_eq!(result.rows, vec![vec![json!(1)]]);

        let calls = f.engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].username, "app_rw");
        assert_eq!(calls[0].host, "orders.internal");
        assert_eq!(calls[0].read_only, Some(false));

        let history = f.state.gateway().get_query_history(f.admin, connection_id, None).unwrap();
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.entries[0].user_id, developer);
        assert_eq!(history.entries[0].query, "SELECT 1");
        assert!(f.state.active_query_ids().is_empty());
    }

    #[tokio::test]
    async fn test_role_account_without_grant_is_denied() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let other = f.member(Role::Developer);
        let connection_id = f.role_account(developer, Role::Developer, "app_rw");

        let err = f.state.run_query(other, connection_id, "SELECT 1").await.unwrap_err();
        assert!(err.is_not_authorized());
        assert!(f.engine.calls().is_empty());
        assert_eq!(f.history_len(connection_id), 0);
    }

    #[tokio::test]
    async fn test_analyst_queries_run_read_only() {
        let f = Fixture::new();
        let analyst = f.member(Role::Analyst);
        let connection_id = f.connection("USE_ROOT");

        f.state.run_query(analyst, connection_id, "SELECT 1").await.unwrap();
        let calls = f.engine.calls();
        assert_eq!(calls[0].username, "postgres");
        assert_eq!(calls[0].read_only, Some(true));
    }

    #[tokio::test]
    async fn test_failed_query_is_not_logged() {
        let f = Fixture::new();
        let connection_id = f.connection("USE_ROOT");

        let err = f.state.run_query(f.admin, connection_id, "BROKEN SQL").await.unwrap_err();
        assert_eq!(err.pg_code(), Some("42601"));
        assert_eq!(f.history_len(connection_id), 0);
    }

    #[tokio::test]
    async fn test_cancelled_query_is_not_logged() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let connection_id = f.connection("USE_ROOT");

        let run = f.state.run_query(developer, connection_id, "SELECT pg_sleep(60)");
        let cancel = async {
            loop {
                if let Some(id) = f.state.active_query_ids().first().copied() {
                    assert!(!f.state.cancel_query(f.admin, &id));
                    assert!(f.state.cancel_query(developer, &id));
                    break;
                }
                tokio::task::yield_now().await;
            }
        };

        let (result, _) = tokio::join!(run, cancel);
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(f.history_len(connection_id), 0);
        assert!(f.state.active_query_ids().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_caller_releases_query_tracking() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let connection_id = f.connection("USE_ROOT");

        let run = f.state.run_query(developer, connection_id, "SELECT pg_sleep(60)");
        let timed_out = tokio::time::timeout(Duration::from_millis(50), run).await.is_err();

        assert!(timed_out);
        assert!(f.state.active_query_ids().is_empty());
        assert_eq!(f.history_len(connection_id), 0);
    }

    #[tokio::test]
    async fn test_query_cancelled_by_id_known_up_front() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let connection_id = f.connection("USE_ROOT");
        let query_id = Uuid::new_v4();

        let run = f.state.run_tracked_query(query_id, developer, connection_id, "SELECT pg_sleep(60)");
        let cancel = async {
            while f.state.get_query(&query_id).is_none() {
                tokio::task::yield_now().await;
            }
            let duplicate = f.state.run_tracked_query(query_id, developer, connection_id, "SELECT 1").await;
            assert!(matches!(duplicate, Err(SluiceError::Validation { .. })));
            assert!(f.state.cancel_query(developer, &query_id));
        };

        let (result, _) = tokio::join!(run, cancel);
        assert!(result.unwrap_err().is_cancelled());
        assert!(f.state.get_query(&query_id).is_none());
    }

    // =========================================================================
    // Tunnels
    // =========================================================================

    #[tokio::test]
    async fn test_keyfile_unreachable_ssh_host_fails_after_retries() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let port = closed_port().await;

        let mut input = f.new_connection("USE_ROOT");
        input.ssh_mode = "KEYFILE".into();
        input.ssh = SshSettings {
            host: SecretString::from(format!("127.0.0.1:{port}")),
            user: SecretString::from("tunnel"),
            password: SecretString::default(),
            key: SecretString::from(TEST_KEY),
        };
        let connection_id = f.state.gateway().create_connection(f.admin, input).unwrap().id;

        let err = f.state.run_query(developer, connection_id, "SELECT 1").await.unwrap_err();
        match err {
            SluiceError::TunnelNetwork { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected tunnel network error, got {other:?}"),
        }
        assert!(f.engine.calls().is_empty());
        assert_eq!(f.history_len(connection_id), 0);
    }

    #[tokio::test]
    async fn test_unusable_key_is_not_retried() {
        let f = Fixture::new();
        let port = closed_port().await;

        let mut input = f.new_connection("USE_ROOT");
        input.ssh_mode = "KEYFILE".into();
        input.ssh = SshSettings {
            host: SecretString::from(format!("127.0.0.1:{port}")),
            user: SecretString::from("tunnel"),
            password: SecretString::default(),
            key: SecretString::from("not a key"),
        };
        let connection_id = f.state.gateway().create_connection(f.admin, input).unwrap().id;

        let err = f.state.gateway().get_data_models(f.admin, connection_id).await.unwrap_err();
        assert!(matches!(err, SluiceError::TunnelAuth { .. }));
        assert!(f.engine.calls().is_empty());
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    #[tokio::test]
    async fn test_analyst_mutations_never_reach_engine() {
        let f = Fixture::new();
        let analyst = f.member(Role::Analyst);
        let connection_id = f.connection("USE_ROOT");
        let gateway = f.state.gateway();

        let err = gateway
            .delete_data(analyst, connection_id, "public", "orders", &[RowId::new("(0,1)")])
            .await
            .unwrap_err();
        assert!(err.is_not_authorized());

        let mut values = ColumnValues::new();
        values.insert("id".into(), json!(4));
        assert!(gateway
            .add_data(analyst, connection_id, "public", "orders", &values)
            .await
            .unwrap_err()
            .is_not_authorized());
        assert!(gateway
            .update_single_data(analyst, connection_id, "public", "orders", &RowId::new("(0,1)"), "id", &json!(5))
            .await
            .unwrap_err()
            .is_not_authorized());

        assert!(f.engine.calls().is_empty());

        // Reads remain available.
        let page = gateway
            .get_data(analyst, connection_id, &DataRequest::new("public", "orders", 50))
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_role_change_applies_to_next_call() {
        let f = Fixture::new();
        let user = f.member(Role::Developer);
        let connection_id = f.connection("USE_ROOT");
        let gateway = f.state.gateway();
        let ids = [RowId::new("(0,1)"), RowId::new("(0,2)")];

        assert_eq!(gateway.delete_data(user, connection_id, "public", "orders", &ids).await.unwrap(), 2);

        f.set_role(user, Role::Analyst);
        assert!(gateway
            .delete_data(user, connection_id, "public", "orders", &ids)
            .await
            .unwrap_err()
            .is_not_authorized());

        f.state.storage().remove_project_member(user, f.project).unwrap();
        assert!(gateway.get_data_models(user, connection_id).await.unwrap_err().is_not_authorized());
        assert_eq!(f.engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_looks_like_denial() {
        let f = Fixture::new();
        let missing = Uuid::new_v4();
        let outsider_err = f.state.run_query(Uuid::new_v4(), f.connection("USE_ROOT"), "SELECT 1").await.unwrap_err();
        let missing_err = f.state.run_query(f.admin, missing, "SELECT 1").await.unwrap_err();

        assert!(outsider_err.is_not_authorized());
        assert!(missing_err.is_not_authorized());
        assert_eq!(outsider_err.to_string(), missing_err.to_string());
    }

    // =========================================================================
    // History
    // =========================================================================

    #[tokio::test]
    async fn test_history_pages_are_complete_and_scoped() {
        let f = Fixture::new();
        let developer = f.member(Role::Developer);
        let analyst = f.member(Role::Analyst);
        let connection_id = f.connection("USE_ROOT");

        for i in 0..30 {
            f.state.run_query(developer, connection_id, &format!("SELECT {i}")).await.unwrap();
        }
        for i in 0..5 {
            f.state.run_query(analyst, connection_id, &format!("SELECT 'a{i}'")).await.unwrap();
        }

        let collect = |actor: Uuid| {
            let mut ids = Vec::new();
            let mut sizes = Vec::new();
            let mut cursor = None;
            loop {
                let page = f.state.gateway().get_query_history(actor, connection_id, cursor).unwrap();
                assert!(page.entries.iter().all(|e| cursor.map_or(true, |c| e.created_at < c)));
                sizes.push(page.entries.len());
                ids.extend(page.entries.iter().map(|e| (e.id, e.user_id)));
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            (ids, sizes)
        };

        let (all, sizes) = collect(f.admin);
        assert_eq!(sizes, vec![25, 10]);
        assert_eq!(all.iter().map(|(id, _)| id).collect::<HashSet<_>>().len(), 35);

        let (own, sizes) = collect(developer);
        assert_eq!(sizes, vec![25, 5]);
        assert!(own.iter().all(|(_, user)| *user == developer));

        let (own, _) = collect(analyst);
        assert_eq!(own.len(), 5);
    }

    // =========================================================================
    // Retry policy
    // =========================================================================

    #[tokio::test]
    async fn test_reads_retry_once_on_connection_loss() {
        let f = Fixture::new();
        let connection_id = f.connection("USE_ROOT");
        let gateway = f.state.gateway();

        f.engine.connection_failures.store(1, Ordering::SeqCst);
        let models = gateway.get_data_models(f.admin, connection_id).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(f.engine.calls().len(), 2);

        f.engine.connection_failures.store(2, Ordering::SeqCst);
        let err = gateway.get_single_data_model(f.admin, connection_id, "public", "orders").await.unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(f.engine.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_mutations_are_never_retried() {
        let f = Fixture::new();
        let connection_id = f.connection("USE_ROOT");

        f.engine.connection_failures.store(1, Ordering::SeqCst);
        let err = f
            .state
            .gateway()
            .update_single_data(f.admin, connection_id, "public", "orders", &RowId::new("(0,1)"), "id", &json!(2))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());

        let calls = f.engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, "update_single_data");
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    #[test]
    fn test_secrets_never_in_debug_output() {
        let f = Fixture::new();
        let connection_id = f.connection("USE_ROOT");
        let (connection, credentials) =
            f.state.gateway().resolve_connectable(f.admin, connection_id).unwrap();

        let debug = format!("{connection:?} {credentials:?}");
        assert!(!debug.contains("root-secret"));
        assert!(!debug.contains("orders.internal"));
        assert_eq!(credentials.password.expose(), "root-secret");
    }

    #[test]
    fn test_all_error_types_produce_valid_error_info() {
        let errors = vec![
            SluiceError::validation("test"),
            SluiceError::not_authorized("test"),
            SluiceError::not_found("connection", Uuid::new_v4()),
            SluiceError::vault("test"),
            SluiceError::tunnel_auth("test"),
            SluiceError::tunnel_network("test"),
            SluiceError::TunnelClosed,
            SluiceError::query("test", None, None, None, None),
            SluiceError::connection("test"),
            SluiceError::query_cancelled(Uuid::new_v4()),
            SluiceError::storage("test", None),
            SluiceError::config("test"),
            SluiceError::internal("test"),
        ];

        for error in errors {
            let info = error.to_error_info();
            assert!(!info.error_type.is_empty(), "error_type should not be empty");
            assert!(!info.message.is_empty(), "message should not be empty");
        }
    }
}
