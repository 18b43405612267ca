//! PostgreSQL engine on `tokio-postgres`.

use super::sql::{self, Statement};
use super::values::{cell_to_json, row_to_json};
use super::{ConnectTarget, QueryEngine};
use crate::error::{SluiceError, SluiceResult};
use crate::models::{
    ColumnDetail, ColumnInfo, ColumnValues, DataModel, DataPage, DataRequest, DataRow,
    DatabaseType, QueryHandle, QueryOptions, QueryResult, QueryType, RowId,
};

use async_trait::async_trait;
use std::time::Instant;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};

const APPLICATION_NAME: &str = "sluice";

const LIST_TABLES_SQL: &str = r#"
    SELECT
        n.nspname AS schema,
        c.relname AS name,
        pg_get_userbyid(c.relowner) AS owner,
        c.reltuples::bigint AS estimated_rows
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p')
      AND n.nspname NOT LIKE 'pg_%'
      AND n.nspname != 'information_schema'
    ORDER BY n.nspname, c.relname
"#;

const SINGLE_TABLE_SQL: &str = r#"
    SELECT
        n.nspname AS schema,
        c.relname AS name,
        pg_get_userbyid(c.relowner) AS owner,
        c.reltuples::bigint AS estimated_rows
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p')
      AND n.nspname = $1
      AND c.relname = $2
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        a.attname AS name,
        pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
        pg_catalog.format_type(a.atttypid, NULL) AS base_type,
        NOT a.attnotnull AS is_nullable,
        COALESCE(
            (SELECT TRUE FROM pg_catalog.pg_constraint c
             WHERE c.conrelid = a.attrelid
               AND c.contype = 'p'
               AND a.attnum = ANY(c.conkey)),
            FALSE
        ) AS is_primary_key,
        pg_get_expr(d.adbin, d.adrelid) AS default_value,
        a.attnum::integer AS ordinal_position
    FROM pg_catalog.pg_attribute a
    JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
    WHERE n.nspname = $1
      AND c.relname = $2
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// A single driver connection. Dropping it aborts the connection task.
struct PgSession {
    client: Client,
    task: JoinHandle<()>,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// PostgreSQL query engine.
#[derive(Debug, Clone, Default)]
pub struct PostgresEngine;

impl PostgresEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }

    async fn connect(target: &ConnectTarget) -> SluiceResult<PgSession> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .dbname(&target.database)
            .user(target.username.expose())
            .password(target.password.expose())
            .connect_timeout(target.connect_timeout)
            .application_name(APPLICATION_NAME);
        if let Some(timeout) = target.statement_timeout {
            config.options(&format!("-c statement_timeout={}", timeout.as_millis()));
        }

        let (client, connection) = tokio::time::timeout(target.connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| {
                SluiceError::connection(format!(
                    "timed out connecting to {}:{}",
                    target.host, target.port
                ))
            })??;

        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Postgres connection closed with error");
            }
        });

        Ok(PgSession { client, task })
    }

    /// Execute arbitrary text; row-returning statements are fetched through a
    /// portal so at most `max_rows + 1` rows ever cross the wire.
    async fn execute(
        client: &mut Client,
        sql: &str,
        options: QueryOptions,
    ) -> SluiceResult<(Vec<ColumnInfo>, Vec<Row>, Option<u64>, bool)> {
        let statement = client.prepare(sql).await?;
        let columns: Vec<ColumnInfo> = statement
            .columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                type_oid: col.type_().oid(),
                type_name: col.type_().name().to_string(),
            })
            .collect();

        if columns.is_empty() {
            let affected = if options.read_only {
                let tx = client.build_transaction().read_only(true).start().await?;
                let affected = tx.execute(&statement, &[]).await?;
                tx.commit().await?;
                affected
            } else {
                client.execute(&statement, &[]).await?
            };
            return Ok((columns, Vec::new(), Some(affected), false));
        }

        let fetch = i32::try_from(options.max_rows.saturating_add(1)).unwrap_or(i32::MAX);
        let tx = client.build_transaction().read_only(options.read_only).start().await?;
        let portal = tx.bind(&statement, &[]).await?;
        let mut rows = tx.query_portal(&portal, fetch).await?;
        drop(portal);
        tx.commit().await?;

        let truncated = rows.len() > options.max_rows;
        rows.truncate(options.max_rows);
        Ok((columns, rows, None, truncated))
    }

    async fn load_model(client: &Client, schema: &str, table: &str) -> SluiceResult<DataModel> {
        let row = client
            .query_opt(SINGLE_TABLE_SQL, &[&schema, &table])
            .await?
            .ok_or_else(|| SluiceError::not_found("table", format!("{schema}.{table}")))?;

        let mut model = table_model(&row);
        let columns = client.query(COLUMNS_SQL, &[&schema, &table]).await?;
        model.columns = columns
            .into_iter()
            .map(|row| ColumnDetail {
                name: row.get("name"),
                data_type: row.get("data_type"),
                base_type: row.get("base_type"),
                is_nullable: row.get("is_nullable"),
                is_primary_key: row.get("is_primary_key"),
                default_value: row.get("default_value"),
                ordinal_position: row.get("ordinal_position"),
            })
            .collect();
        Ok(model)
    }
}

#[async_trait]
impl QueryEngine for PostgresEngine {
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
        let start = Instant::now();
        let query_type = QueryType::detect(sql);
        let mut session = Self::connect(target).await?;
        let cancel_token = session.client.cancel_token();

        tracing::debug!(
            query_id = %handle.id(),
            query_type = ?query_type,
            read_only = options.read_only,
            "Executing query"
        );

        let outcome = select! {
            result = Self::execute(&mut session.client, sql, options) => result,
            _ = handle.cancelled() => {
                tracing::debug!(query_id = %handle.id(), "Query cancelled");
                if let Err(e) = cancel_token.cancel_query(NoTls).await {
                    tracing::warn!(query_id = %handle.id(), error = %e, "Server-side cancel failed");
                }
                return Err(SluiceError::query_cancelled(handle.id()));
            }
        };

        let (columns, rows, rows_affected, truncated) = outcome?;
        let execution_time_ms = start.elapsed().as_millis() as u64;
        let rows_affected = rows_affected.or(match query_type {
            QueryType::Insert | QueryType::Update | QueryType::Delete => Some(rows.len() as u64),
            _ => None,
        });

        tracing::debug!(
            query_id = %handle.id(),
            execution_time_ms,
            row_count = rows.len(),
            truncated,
            "Query completed"
        );

        Ok(QueryResult {
            query_id: handle.id(),
            columns,
            rows: rows.iter().map(row_to_json).collect(),
            rows_affected,
            truncated,
            execution_time_ms,
            query_type,
        })
    }

    async fn list_data_models(&self, target: &ConnectTarget) -> SluiceResult<Vec<DataModel>> {
        let session = Self::connect(target).await?;
        let rows = session.client.query(LIST_TABLES_SQL, &[]).await?;
        Ok(rows.iter().map(table_model).collect())
    }

    async fn get_single_data_model(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
    ) -> SluiceResult<DataModel> {
        let session = Self::connect(target).await?;
        Self::load_model(&session.client, schema, table).await
    }

    async fn get_data(
        &self,
        target: &ConnectTarget,
        request: &DataRequest,
        max_page_rows: i64,
    ) -> SluiceResult<DataPage> {
        let session = Self::connect(target).await?;
        let model = Self::load_model(&session.client, &request.schema, &request.table).await?;
        let request = request.clone().validated(&model, max_page_rows)?;

        let page = sql::select_page(&model, &request)?;
        let rows = session.client.query(&page.sql, &bind(&page)).await?;
        let rows = rows.iter().map(data_row).collect::<SluiceResult<Vec<_>>>()?;

        let total_count = if request.fetch_count {
            let count = sql::count_rows(&model, &request)?;
            let row = session.client.query_one(&count.sql, &bind(&count)).await?;
            Some(row.try_get::<_, i64>(0)?)
        } else {
            None
        };

        Ok(DataPage { columns: model.column_names(), rows, total_count })
    }

    async fn add_data(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
        values: &ColumnValues,
    ) -> SluiceResult<DataRow> {
        let session = Self::connect(target).await?;
        let model = Self::load_model(&session.client, schema, table).await?;
        let insert = sql::insert_row(&model, values)?;
        let row = session.client.query_one(&insert.sql, &bind(&insert)).await?;
        data_row(&row)
    }

    async fn delete_data(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
        row_ids: &[RowId],
    ) -> SluiceResult<u64> {
        let session = Self::connect(target).await?;
        let model = Self::load_model(&session.client, schema, table).await?;
        let ids: Vec<String> = row_ids.iter().map(|id| id.as_str().to_string()).collect();
        let delete = sql::delete_rows(&model, &ids)?;
        Ok(session.client.execute(&delete.sql, &bind(&delete)).await?)
    }

    async fn update_single_data(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
        row_id: &RowId,
        column: &str,
        value: &serde_json::Value,
    ) -> SluiceResult<DataRow> {
        let session = Self::connect(target).await?;
        let model = Self::load_model(&session.client, schema, table).await?;
        let update = sql::update_cell(&model, row_id.as_str(), column, value)?;
        let row = session
            .client
            .query_opt(&update.sql, &bind(&update))
            .await?
            .ok_or_else(|| SluiceError::not_found("row", row_id))?;
        data_row(&row)
    }
}

fn bind(stmt: &Statement) -> Vec<&(dyn ToSql + Sync)> {
    stmt.params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn table_model(row: &Row) -> DataModel {
    DataModel {
        schema: row.get("schema"),
        name: row.get("name"),
        owner: row.get("owner"),
        estimated_rows: row.get("estimated_rows"),
        columns: Vec::new(),
    }
}

/// Split a generated row into its identity and the model's columns.
fn data_row(row: &Row) -> SluiceResult<DataRow> {
    let row_id: String = row.try_get(0)?;
    let values = (1..row.columns().len()).map(|idx| cell_to_json(row, idx)).collect();
    Ok(DataRow { row_id: RowId::new(row_id), values })
}
