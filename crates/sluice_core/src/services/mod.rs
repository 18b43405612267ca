//! Backend services for the Sluice gateway core.
//!
//! This module contains all service layer abstractions:
//! - `vault` - AES-256-GCM encryption of sensitive fields at rest
//! - `storage` - Local SQLite storage for connections, membership, logs and saved queries
//! - `authz` - Role-based authorization over a membership directory
//! - `registry` - Connection definitions and credential selection
//! - `tunnel` - SSH tunnels with retrying dial and local port forwarding
//! - `engine` - Database engine trait and the PostgreSQL implementation
//! - `audit` - Query log and history pagination
//! - `saved_queries` - Named queries per connection
//! - `gateway` - Authorized entry points tying the services together

pub mod audit;
pub mod authz;
pub mod engine;
pub mod gateway;
pub mod registry;
pub mod saved_queries;
pub mod storage;
pub mod tunnel;
pub mod vault;

pub use audit::AuditLog;
pub use authz::{AuthorizationGate, MembershipDirectory};
pub use engine::{ConnectTarget, EngineRegistry, PostgresEngine, QueryEngine};
pub use gateway::Gateway;
pub use registry::ConnectionRegistry;
pub use saved_queries::SavedQueryStore;
pub use storage::LocalStorage;
pub use tunnel::{Tunnel, TunnelManager, TunnelRequest, TunnelState};
pub use vault::Vault;
