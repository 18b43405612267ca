//! Data models for the Sluice gateway core.
//!
//! This module contains all core data structures:
//! - `connection` - Connection, CredentialSet, SecretString, login and SSH modes
//! - `project` - Role, ProjectMember, LogScope
//! - `query` - QueryHandle, QueryResult, QueryOptions, ColumnInfo
//! - `history` - QueryLogEntry, HistoryPage, SavedQuery
//! - `data` - DataModel, DataRequest, DataPage, filters and row identity

pub mod connection;
pub mod data;
pub mod history;
pub mod project;
pub mod query;

pub use connection::{
    Connection, CredentialSet, DatabaseType, LoginMode, NewConnection, SecretString, SshMode,
    SshSettings,
};
pub use data::{
    ColumnDetail, ColumnValues, DataModel, DataPage, DataRequest, DataRow, Filter, FilterOp,
    RowId, Sort, SortDirection,
};
pub use history::{HistoryPage, QueryLogEntry, SaveQueryRequest, SavedQuery};
pub use project::{LogScope, ProjectMember, Role};
pub use query::{ColumnInfo, QueryHandle, QueryOptions, QueryResult, QueryType};
