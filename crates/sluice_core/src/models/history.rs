//! Query history and saved query models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record of a successfully executed query. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    /// Unique identifier
    pub id: Uuid,
    /// User who ran the query
    pub user_id: Uuid,
    /// Connection the query ran against
    pub connection_id: Uuid,
    /// The executed SQL
    pub query: String,
    /// Strictly increasing execution timestamp (nanosecond precision)
    pub created_at: DateTime<Utc>,
}

impl QueryLogEntry {
    /// Create a new entry. `created_at` is assigned by the store.
    pub fn new(user_id: Uuid, connection_id: Uuid, query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            connection_id,
            query: query.into(),
            created_at: Utc::now(),
        }
    }
}

/// One page of query history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    /// Entries strictly older than the requested cursor
    pub entries: Vec<QueryLogEntry>,
    /// Cursor for the next page; `None` when this page was not full
    pub next_cursor: Option<DateTime<Utc>>,
}

/// A named, persisted query text bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedQuery {
    /// Unique identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Query text
    pub query: String,
    /// Connection the query belongs to
    pub connection_id: Uuid,
    /// User who created it
    pub created_by: Uuid,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Upsert input for a saved query.
#[derive(Debug, Clone, Default)]
pub struct SaveQueryRequest {
    /// Existing query to update; `None` creates a new one
    pub id: Option<Uuid>,
    /// Display name
    pub name: String,
    /// Query text
    pub query: String,
}
