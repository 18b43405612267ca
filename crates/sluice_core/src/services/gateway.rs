//! Entry points of the gateway core.
//!
//! Every operation takes the acting user's id and re-derives that user's
//! role, credential set and tunnel from scratch. A connection that does not
//! exist is reported to data-plane callers exactly like one they may not
//! access.

use crate::config::CoreConfig;
use crate::error::{SluiceError, SluiceResult};
use crate::models::{
    ColumnValues, Connection, CredentialSet, DataModel, DataPage, DataRequest, DataRow,
    HistoryPage, NewConnection, QueryHandle, QueryOptions, QueryResult, Role, RowId,
    SaveQueryRequest, SavedQuery,
};
use crate::services::audit::AuditLog;
use crate::services::authz::{AuthorizationGate, MembershipDirectory};
use crate::services::engine::{ConnectTarget, EngineRegistry, QueryEngine};
use crate::services::registry::ConnectionRegistry;
use crate::services::saved_queries::SavedQueryStore;
use crate::services::storage::LocalStorage;
use crate::services::tunnel::{Tunnel, TunnelManager, TunnelRequest};

use backon::{ConstantBuilder, Retryable};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TUNNEL_HOST: &str = "127.0.0.1";

/// One resolved route to a database. The tunnel, if any, lives as long as this.
struct Session {
    engine: Arc<dyn QueryEngine>,
    target: ConnectTarget,
    _tunnel: Option<Tunnel>,
}

/// Multi-user gateway over the registry, tunnels, engines and audit log.
#[derive(Clone)]
pub struct Gateway {
    registry: ConnectionRegistry,
    gate: AuthorizationGate,
    tunnels: TunnelManager,
    engines: EngineRegistry,
    audit: AuditLog,
    saved_queries: SavedQueryStore,
    config: CoreConfig,
}

impl Gateway {
    /// Create a gateway whose project membership comes from `directory`.
    pub fn new(
        storage: Arc<LocalStorage>,
        directory: Arc<dyn MembershipDirectory>,
        engines: EngineRegistry,
        config: CoreConfig,
    ) -> Self {
        let gate = AuthorizationGate::new(directory);
        Self {
            registry: ConnectionRegistry::new(storage.clone(), gate.clone()),
            gate,
            tunnels: TunnelManager::new(config.tunnel.clone()),
            engines,
            audit: AuditLog::new(storage.clone()),
            saved_queries: SavedQueryStore::new(storage),
            config,
        }
    }

    /// The authorization gate in use.
    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    // ========== Connection Management ==========

    /// Create a connection in a project. Admin only.
    pub fn create_connection(&self, actor: Uuid, input: NewConnection) -> SluiceResult<Connection> {
        self.gate.require_admin(actor, input.project_id)?;
        self.registry.create_connection(actor, input)
    }

    /// Persist edits of a connection. Admin only.
    ///
    /// Identity, project and creation metadata are kept from the stored row.
    pub fn save_connection(&self, actor: Uuid, mut connection: Connection) -> SluiceResult<Connection> {
        let existing = self.existing(connection.id)?;
        self.gate.require_admin(actor, existing.project_id)?;
        if connection.project_id != existing.project_id {
            return Err(SluiceError::validation("a connection cannot move between projects"));
        }
        connection.created_by = existing.created_by;
        connection.created_at = existing.created_at;
        self.registry.save_connection(connection)
    }

    /// Create or update a credential set. Admin only.
    pub fn save_credential_set(&self, actor: Uuid, set: CredentialSet) -> SluiceResult<CredentialSet> {
        let connection = self.existing(set.connection_id)?;
        self.gate.require_admin(actor, connection.project_id)?;
        self.registry.save_credential_set(set)
    }

    /// Delete a connection with its credential sets and saved queries. Admin only.
    pub fn delete_connection(&self, actor: Uuid, connection_id: Uuid) -> SluiceResult<()> {
        let connection = self.existing(connection_id)?;
        self.gate.require_admin(actor, connection.project_id)?;
        self.registry.delete_connection(connection_id)
    }

    /// Connections of a project visible to the actor.
    pub fn list_connections(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<Vec<Connection>> {
        self.gate.require_read(actor, project_id)?;
        self.registry.list_connections(project_id)
    }

    /// The connection and credential set the actor would connect with.
    pub fn resolve_connectable(
        &self,
        actor: Uuid,
        connection_id: Uuid,
    ) -> SluiceResult<(Connection, CredentialSet)> {
        self.registry.resolve_connectable(connection_id, actor).map_err(deny_missing)
    }

    // ========== Query Execution ==========

    /// Run arbitrary SQL and record it in the query log.
    ///
    /// Roles that may not mutate run inside a read-only transaction.
    pub async fn run_query(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        sql: &str,
        handle: &QueryHandle,
    ) -> SluiceResult<QueryResult> {
        let (_, role) = self.authorize(actor, connection_id, false)?;
        let options =
            QueryOptions { read_only: !role.can_mutate(), max_rows: self.config.max_result_rows };

        let session = self.open_session(actor, connection_id, handle).await?;
        let result = session.engine.run_query(&session.target, sql, options, handle).await;
        drop(session);

        let result = result.map_err(|e| {
            tracing::debug!(
                query_id = %handle.id(),
                connection_id = %connection_id,
                user_id = %actor,
                error = %e,
                "Query failed"
            );
            e
        })?;

        self.audit.record(actor, connection_id, sql);
        tracing::info!(
            query_id = %handle.id(),
            connection_id = %connection_id,
            user_id = %actor,
            row_count = result.row_count(),
            execution_time_ms = result.execution_time_ms,
            "Query executed"
        );
        Ok(result)
    }

    /// One page of the connection's query history strictly older than `before`.
    ///
    /// Admins see every user's entries; other roles only their own.
    pub fn get_query_history(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        before: Option<DateTime<Utc>>,
    ) -> SluiceResult<HistoryPage> {
        let (connection, _) = self.authorize(actor, connection_id, false)?;
        let scope = self.gate.visible_log_scope(actor, connection.project_id)?;
        self.audit.history(connection_id, scope, actor, before, self.config.history_page_size)
    }

    // ========== Introspection and Table Data ==========

    /// Tables of the connection's database.
    pub async fn get_data_models(&self, actor: Uuid, connection_id: Uuid) -> SluiceResult<Vec<DataModel>> {
        self.authorize(actor, connection_id, false)?;
        self.read_with_retry(actor, connection_id, |engine, target| async move {
            engine.list_data_models(&target).await
        })
        .await
    }

    /// One table with its columns.
    pub async fn get_single_data_model(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        schema: &str,
        table: &str,
    ) -> SluiceResult<DataModel> {
        self.authorize(actor, connection_id, false)?;
        self.read_with_retry(actor, connection_id, |engine, target| async move {
            engine.get_single_data_model(&target, schema, table).await
        })
        .await
    }

    /// One bounded page of table data.
    pub async fn get_data(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        request: &DataRequest,
    ) -> SluiceResult<DataPage> {
        self.authorize(actor, connection_id, false)?;
        let max_page_rows = self.config.max_page_rows;
        self.read_with_retry(actor, connection_id, |engine, target| async move {
            engine.get_data(&target, request, max_page_rows).await
        })
        .await
    }

    /// Insert one row.
    pub async fn add_data(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        schema: &str,
        table: &str,
        values: &ColumnValues,
    ) -> SluiceResult<DataRow> {
        self.authorize(actor, connection_id, true)?;
        let session = self.open_data_session(actor, connection_id).await?;
        let row = session.engine.add_data(&session.target, schema, table, values).await?;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %actor,
            schema,
            table,
            row_id = %row.row_id,
            "Row inserted"
        );
        Ok(row)
    }

    /// Delete rows by identity.
    pub async fn delete_data(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        schema: &str,
        table: &str,
        row_ids: &[RowId],
    ) -> SluiceResult<u64> {
        self.authorize(actor, connection_id, true)?;
        let session = self.open_data_session(actor, connection_id).await?;
        let deleted = session.engine.delete_data(&session.target, schema, table, row_ids).await?;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %actor,
            schema,
            table,
            requested = row_ids.len(),
            deleted,
            "Rows deleted"
        );
        Ok(deleted)
    }

    /// Set one column of one row.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_single_data(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        schema: &str,
        table: &str,
        row_id: &RowId,
        column: &str,
        value: &serde_json::Value,
    ) -> SluiceResult<DataRow> {
        self.authorize(actor, connection_id, true)?;
        let session = self.open_data_session(actor, connection_id).await?;
        let row = session
            .engine
            .update_single_data(&session.target, schema, table, row_id, column, value)
            .await?;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %actor,
            schema,
            table,
            column,
            row_id = %row_id,
            "Cell updated"
        );
        Ok(row)
    }

    // ========== Saved Queries ==========

    /// Create or update a saved query of the connection.
    pub fn save_query(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        request: SaveQueryRequest,
    ) -> SluiceResult<SavedQuery> {
        self.authorize(actor, connection_id, false)?;
        self.saved_queries.upsert(actor, connection_id, request)
    }

    /// Saved queries of the connection.
    pub fn list_queries_for_connection(
        &self,
        actor: Uuid,
        connection_id: Uuid,
    ) -> SluiceResult<Vec<SavedQuery>> {
        self.authorize(actor, connection_id, false)?;
        self.saved_queries.list(connection_id)
    }

    /// A saved query the actor may see. Hidden queries report `NotFound`.
    pub fn get_saved_query(&self, actor: Uuid, query_id: Uuid) -> SluiceResult<SavedQuery> {
        let query = self.saved_queries.get(query_id)?;
        match self.authorize(actor, query.connection_id, false) {
            Ok(_) => Ok(query),
            Err(e) if e.is_not_authorized() => Err(SluiceError::not_found("saved query", query_id)),
            Err(e) => Err(e),
        }
    }

    // ========== Routing ==========

    /// Stored connection for a control-plane call; missing reads as denied.
    fn existing(&self, connection_id: Uuid) -> SluiceResult<Connection> {
        self.registry.load_connection(connection_id).map_err(deny_missing)
    }

    /// Check the actor's current role on the connection's project.
    fn authorize(&self, actor: Uuid, connection_id: Uuid, mutate: bool) -> SluiceResult<(Connection, Role)> {
        let connection = self.existing(connection_id)?;
        let role = if mutate {
            self.gate.require_mutate(actor, connection.project_id)?
        } else {
            self.gate.require_read(actor, connection.project_id)?
        };
        Ok((connection, role))
    }

    /// Resolve credentials, open the tunnel if needed, and pick the engine.
    async fn open_session(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        handle: &QueryHandle,
    ) -> SluiceResult<Session> {
        let (connection, credentials) = self.resolve_connectable(actor, connection_id)?;
        let engine = self.engines.get(connection.db_type)?;

        let (tunnel, host, port) = match TunnelRequest::for_connection(&connection)? {
            Some(request) => {
                let tunnel = self.tunnels.open(request, handle).await?;
                let port = tunnel.endpoint()?.port();
                (Some(tunnel), TUNNEL_HOST.to_string(), port)
            }
            None => (None, connection.host.expose().to_string(), connection.port_number()?),
        };

        let target = ConnectTarget {
            host,
            port,
            database: connection.database.expose().to_string(),
            username: credentials.username,
            password: credentials.password,
            connect_timeout: self.config.connect_timeout(),
            statement_timeout: self.config.statement_timeout(),
        };

        Ok(Session { engine, target, _tunnel: tunnel })
    }

    async fn open_data_session(&self, actor: Uuid, connection_id: Uuid) -> SluiceResult<Session> {
        let handle = QueryHandle::new(connection_id, actor, "");
        self.open_session(actor, connection_id, &handle).await
    }

    /// Run a read against a fresh session, retrying once on connectivity loss.
    async fn read_with_retry<T, F, Fut>(&self, actor: Uuid, connection_id: Uuid, op: F) -> SluiceResult<T>
    where
        F: Fn(Arc<dyn QueryEngine>, ConnectTarget) -> Fut,
        Fut: Future<Output = SluiceResult<T>>,
    {
        let attempt = {
            let op = &op;
            move || async move {
                let session = self.open_data_session(actor, connection_id).await?;
                let result = op(session.engine.clone(), session.target.clone()).await;
                drop(session);
                result
            }
        };

        attempt
            .retry(ConstantBuilder::default().with_delay(Duration::ZERO).with_max_times(1))
            .when(|err: &SluiceError| err.is_connection_lost())
            .notify(|err, _| {
                tracing::warn!(connection_id = %connection_id, error = %err, "Connection lost, retrying read");
            })
            .await
    }
}

/// Report a missing connection as a denial.
fn deny_missing(err: SluiceError) -> SluiceError {
    match err {
        SluiceError::NotFound { resource: "connection", .. } => {
            SluiceError::not_authorized("not allowed to access this connection")
        }
        other => other,
    }
}
