//! Query execution models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Type of SQL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// SELECT query returning rows
    Select,
    /// INSERT operation
    Insert,
    /// UPDATE operation
    Update,
    /// DELETE operation
    Delete,
    /// DDL, COPY, or other operations
    Other,
}

impl QueryType {
    /// Detect the type of SQL query from its leading keyword.
    pub fn detect(sql: &str) -> Self {
        let keyword: String = sql
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" | "SHOW" | "VALUES" | "TABLE" | "EXPLAIN" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }
}

/// Column metadata from query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Engine type identifier (Postgres type OID)
    pub type_oid: u32,
    /// Human-readable type name
    pub type_name: String,
}

/// Per-call execution options for an arbitrary query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Execute inside a read-only transaction.
    pub read_only: bool,
    /// Maximum rows kept in the result.
    pub max_rows: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { read_only: false, max_rows: 10_000 }
    }
}

/// Handle for tracking and cancelling a running query.
pub struct QueryHandle {
    /// Unique query identifier
    id: Uuid,
    /// Associated connection
    connection_id: Uuid,
    /// Acting user
    user_id: Uuid,
    /// The SQL being executed
    sql: String,
    /// Cancellation token for interrupting the query
    cancel_token: CancellationToken,
    /// Execution start time
    started_at: DateTime<Utc>,
}

impl QueryHandle {
    /// Create a new query handle.
    pub fn new(connection_id: Uuid, user_id: Uuid, sql: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), connection_id, user_id, sql)
    }

    /// Create a handle under an identifier chosen by the caller.
    pub fn with_id(id: Uuid, connection_id: Uuid, user_id: Uuid, sql: impl Into<String>) -> Self {
        Self {
            id,
            connection_id,
            user_id,
            sql: sql.into(),
            cancel_token: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Get the unique query identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the associated connection ID.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Get the acting user.
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Get the SQL being executed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get when execution started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    /// Request cancellation of the query.
    pub fn cancel(&self) {
        tracing::debug!(query_id = %self.id, "Cancellation requested");
        self.cancel_token.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    /// Get a clone of the cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("started_at", &self.started_at)
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Results from query execution.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// The query handle ID
    pub query_id: Uuid,
    /// Column metadata
    pub columns: Vec<ColumnInfo>,
    /// Result rows, one JSON value per column
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows affected (for INSERT/UPDATE/DELETE and other commands)
    pub rows_affected: Option<u64>,
    /// Whether rows beyond `max_rows` were dropped
    pub truncated: bool,
    /// Time to execute in milliseconds
    pub execution_time_ms: u64,
    /// Type of query
    pub query_type: QueryType,
}

impl QueryResult {
    /// Get the number of rows returned.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
