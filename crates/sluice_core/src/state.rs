//! Process-wide gateway state.
//!
//! Owns the local store and the gateway built over it, and tracks running
//! queries so they can be cancelled by id from another request.

use crate::config::CoreConfig;
use crate::error::{SluiceError, SluiceResult};
use crate::models::{QueryHandle, QueryResult};
use crate::services::storage::init_data_dir;
use crate::services::{EngineRegistry, Gateway, LocalStorage, MembershipDirectory, Vault};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Central gateway state.
///
/// Thread-safe via `parking_lot::RwLock`; share it behind an `Arc`.
pub struct SluiceState {
    /// Authorized entry points
    gateway: Gateway,
    /// Local SQLite storage
    storage: Arc<LocalStorage>,
    /// Running queries with cancellation support
    active_queries: RwLock<HashMap<Uuid, Arc<QueryHandle>>>,
    /// Loaded configuration
    config: CoreConfig,
}

impl SluiceState {
    /// Create state from the configuration found in the default locations.
    pub fn new() -> SluiceResult<Self> {
        Self::from_config(CoreConfig::load()?)
    }

    /// Create state with the built-in engines and the local membership table.
    pub fn from_config(config: CoreConfig) -> SluiceResult<Self> {
        Self::with_engines(config, EngineRegistry::with_defaults(), None)
    }

    /// Create state with explicit engines and, optionally, an external
    /// membership directory in place of the local `project_members` table.
    pub fn with_engines(
        config: CoreConfig,
        engines: EngineRegistry,
        directory: Option<Arc<dyn MembershipDirectory>>,
    ) -> SluiceResult<Self> {
        init_data_dir(&config.data_dir)?;

        let vault = Vault::from_config(config.encryption_key.as_deref())?;
        let storage = Arc::new(LocalStorage::open_with_path(
            config.database_path(),
            config.data_dir.clone(),
            vault,
        )?);
        let directory =
            directory.unwrap_or_else(|| storage.clone() as Arc<dyn MembershipDirectory>);
        let gateway = Gateway::new(storage.clone(), directory, engines, config.clone());

        tracing::info!(data_dir = %config.data_dir.display(), "SluiceState initialized");

        Ok(Self { gateway, storage, active_queries: RwLock::new(HashMap::new()), config })
    }

    // ========== Query Tracking ==========

    /// Register a query for tracking.
    pub fn register_query(&self, handle: QueryHandle) -> Arc<QueryHandle> {
        let id = handle.id();
        let handle = Arc::new(handle);
        self.active_queries.write().insert(id, handle.clone());
        tracing::trace!(query_id = %id, "Query registered");
        handle
    }

    /// Get a query handle by ID.
    pub fn get_query(&self, id: &Uuid) -> Option<Arc<QueryHandle>> {
        self.active_queries.read().get(id).cloned()
    }

    /// Unregister a completed or cancelled query.
    pub fn unregister_query(&self, id: &Uuid) -> Option<Arc<QueryHandle>> {
        let handle = self.active_queries.write().remove(id);
        if handle.is_some() {
            tracing::trace!(query_id = %id, "Query unregistered");
        }
        handle
    }

    /// Cancel a running query on behalf of `actor`.
    ///
    /// Only the user who started the query may cancel it. Returns true if the
    /// query was found and cancellation was requested.
    pub fn cancel_query(&self, actor: Uuid, id: &Uuid) -> bool {
        match self.active_queries.read().get(id) {
            Some(handle) if handle.user_id() == actor => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Get all active query IDs.
    pub fn active_query_ids(&self) -> Vec<Uuid> {
        self.active_queries.read().keys().copied().collect()
    }

    /// Run a query tracked under a fresh handle for its whole lifetime.
    pub async fn run_query(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        sql: &str,
    ) -> SluiceResult<QueryResult> {
        self.run_tracked_query(Uuid::new_v4(), actor, connection_id, sql).await
    }

    /// Run a query under an id the caller already holds, so another request
    /// can cancel it while it runs.
    ///
    /// The id is released when the query finishes or the future is dropped.
    pub async fn run_tracked_query(
        &self,
        query_id: Uuid,
        actor: Uuid,
        connection_id: Uuid,
        sql: &str,
    ) -> SluiceResult<QueryResult> {
        let handle = {
            let mut active = self.active_queries.write();
            if active.contains_key(&query_id) {
                return Err(SluiceError::validation(format!("query {query_id} is already running")));
            }
            let handle = Arc::new(QueryHandle::with_id(query_id, connection_id, actor, sql));
            active.insert(query_id, handle.clone());
            handle
        };
        tracing::trace!(query_id = %query_id, "Query registered");
        let _tracked = TrackedQuery { state: self, id: query_id };

        self.gateway.run_query(actor, connection_id, sql, &handle).await
    }

    // ========== Service Accessors ==========

    /// Get the gateway.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Get the local storage service.
    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }
}

/// Unregisters a running query when dropped.
struct TrackedQuery<'a> {
    state: &'a SluiceState,
    id: Uuid,
}

impl Drop for TrackedQuery<'_> {
    fn drop(&mut self) {
        self.state.unregister_query(&self.id);
    }
}
