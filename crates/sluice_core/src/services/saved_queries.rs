//! Named queries saved against a connection.

use crate::error::{SluiceError, SluiceResult};
use crate::models::{SaveQueryRequest, SavedQuery};
use crate::services::storage::LocalStorage;

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Saved query store over the local store.
#[derive(Clone)]
pub struct SavedQueryStore {
    storage: Arc<LocalStorage>,
}

impl SavedQueryStore {
    /// Create a store over the local store.
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        Self { storage }
    }

    /// Create or update a saved query.
    ///
    /// Without an id a new query is created. With an id the existing query of
    /// the same connection is renamed and its text replaced.
    pub fn upsert(
        &self,
        actor: Uuid,
        connection_id: Uuid,
        request: SaveQueryRequest,
    ) -> SluiceResult<SavedQuery> {
        if request.name.trim().is_empty() {
            return Err(SluiceError::validation("query name is required"));
        }

        let saved = match request.id {
            None => {
                let now = Utc::now();
                SavedQuery {
                    id: Uuid::new_v4(),
                    name: request.name,
                    query: request.query,
                    connection_id,
                    created_by: actor,
                    created_at: now,
                    updated_at: now,
                }
            }
            Some(id) => {
                let mut existing = self
                    .storage
                    .load_saved_query(id)?
                    .filter(|q| q.connection_id == connection_id)
                    .ok_or_else(|| SluiceError::not_found("saved query", id))?;
                existing.name = request.name;
                existing.query = request.query;
                existing.updated_at = Utc::now();
                existing
            }
        };

        self.storage.save_query(&saved)?;
        Ok(saved)
    }

    /// Load a saved query or fail with `NotFound`.
    pub fn get(&self, id: Uuid) -> SluiceResult<SavedQuery> {
        self.storage.load_saved_query(id)?.ok_or_else(|| SluiceError::not_found("saved query", id))
    }

    /// Saved queries of a connection, by name.
    pub fn list(&self, connection_id: Uuid) -> SluiceResult<Vec<SavedQuery>> {
        self.storage.list_saved_queries(connection_id)
    }
}
