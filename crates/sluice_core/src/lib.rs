//! Core of the Sluice multi-user database gateway.
//!
//! This crate provides the connection and query execution layer:
//!
//! - **config**: Figment-loaded process configuration
//! - **error**: Error handling with PostgreSQL-specific details
//! - **models**: Connections, credential sets, roles, queries, history and table data
//! - **services**: Vault, storage, authorization, registry, tunnels, engines, audit, gateway
//! - **state**: Process-wide state with running-query tracking
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod verification_tests;

pub use config::{CoreConfig, TunnelConfig};
pub use error::{ErrorInfo, SluiceError, SluiceResult};
pub use models::{
    ColumnDetail, ColumnInfo, ColumnValues, Connection, CredentialSet, DataModel, DataPage,
    DataRequest, DataRow, DatabaseType, Filter, FilterOp, HistoryPage, LogScope, LoginMode,
    NewConnection, ProjectMember, QueryHandle, QueryLogEntry, QueryOptions, QueryResult,
    QueryType, Role, RowId, SaveQueryRequest, SavedQuery, SecretString, Sort, SortDirection,
    SshMode, SshSettings,
};
pub use services::{
    AuditLog, AuthorizationGate, ConnectionRegistry, EngineRegistry, Gateway, LocalStorage,
    MembershipDirectory, PostgresEngine, QueryEngine, SavedQueryStore, TunnelManager, Vault,
};
pub use state::SluiceState;
