//! Database engine abstraction.
//!
//! Each supported [`DatabaseType`] has one [`QueryEngine`] implementation,
//! looked up through the [`EngineRegistry`]. Engines open one driver
//! connection per call against a [`ConnectTarget`] and release it before
//! returning.

pub mod postgres;
pub mod sql;
pub mod values;

use crate::error::{SluiceError, SluiceResult};
use crate::models::{
    ColumnValues, DataModel, DataPage, DataRequest, DataRow, DatabaseType, QueryHandle,
    QueryOptions, QueryResult, RowId, SecretString,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use postgres::PostgresEngine;

/// Where and as whom an engine connects.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Host (the tunnel's loopback address when tunneled)
    pub host: String,
    /// Port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Database user
    pub username: SecretString,
    /// Database password
    pub password: SecretString,
    /// Driver connect timeout
    pub connect_timeout: Duration,
    /// Server-side statement timeout
    pub statement_timeout: Option<Duration>,
}

/// Capabilities every database engine provides.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// The engine type served.
    fn database_type(&self) -> DatabaseType;

    /// Run arbitrary query text, passed through unchanged.
    async fn run_query(
        &self,
        target: &ConnectTarget,
        sql: &str,
        options: QueryOptions,
        handle: &QueryHandle,
    ) -> SluiceResult<QueryResult>;

    /// List the tables of the database (columns omitted).
    async fn list_data_models(&self, target: &ConnectTarget) -> SluiceResult<Vec<DataModel>>;

    /// Describe one table with its columns.
    async fn get_single_data_model(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
    ) -> SluiceResult<DataModel>;

    /// Read one bounded page of a table.
    async fn get_data(
        &self,
        target: &ConnectTarget,
        request: &DataRequest,
        max_page_rows: i64,
    ) -> SluiceResult<DataPage>;

    /// Insert one row.
    async fn add_data(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
        values: &ColumnValues,
    ) -> SluiceResult<DataRow>;

    /// Delete rows by identity, returning the number removed.
    async fn delete_data(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
        row_ids: &[RowId],
    ) -> SluiceResult<u64>;

    /// Set one column of one row.
    async fn update_single_data(
        &self,
        target: &ConnectTarget,
        schema: &str,
        table: &str,
        row_id: &RowId,
        column: &str,
        value: &serde_json::Value,
    ) -> SluiceResult<DataRow>;
}

/// Engines keyed by database type.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<DatabaseType, Arc<dyn QueryEngine>>,
}

impl EngineRegistry {
    /// Registry with every built-in engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(PostgresEngine::new()));
        registry
    }

    /// Register or replace the engine for its database type.
    pub fn register(&mut self, engine: Arc<dyn QueryEngine>) {
        self.engines.insert(engine.database_type(), engine);
    }

    /// Engine for a database type.
    pub fn get(&self, db_type: DatabaseType) -> SluiceResult<Arc<dyn QueryEngine>> {
        self.engines.get(&db_type).cloned().ok_or_else(|| {
            SluiceError::validation(format!("no engine registered for {}", db_type.as_str()))
        })
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry").field("engines", &self.engines.keys().collect::<Vec<_>>()).finish()
    }
}
