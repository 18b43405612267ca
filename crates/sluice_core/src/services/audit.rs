//! Append-only record of executed queries.

use crate::error::SluiceResult;
use crate::models::{HistoryPage, LogScope, QueryLogEntry};
use crate::services::storage::LocalStorage;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Query log over the local store.
#[derive(Clone)]
pub struct AuditLog {
    storage: Arc<LocalStorage>,
}

impl AuditLog {
    /// Create an audit log over the local store.
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        Self { storage }
    }

    /// Record a successfully executed query.
    ///
    /// Never fails the caller: a storage error is reported at ERROR level and
    /// `None` is returned.
    pub fn record(&self, user_id: Uuid, connection_id: Uuid, query: &str) -> Option<QueryLogEntry> {
        let entry = QueryLogEntry::new(user_id, connection_id, query);
        match self.storage.append_query_log(&entry) {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::error!(
                    target: "sluice::audit",
                    connection_id = %connection_id,
                    user_id = %user_id,
                    log_id = %entry.id,
                    error = %e,
                    "Failed to record query"
                );
                None
            }
        }
    }

    /// One page of history strictly older than `before` (now when absent).
    pub fn history(
        &self,
        connection_id: Uuid,
        scope: LogScope,
        actor: Uuid,
        before: Option<DateTime<Utc>>,
        page_size: usize,
    ) -> SluiceResult<HistoryPage> {
        let user_filter = match scope {
            LogScope::AllUsers => None,
            LogScope::SelfOnly => Some(actor),
        };
        // The newest entry may be stamped ahead of the wall clock.
        let before = before.unwrap_or_else(|| Utc.timestamp_nanos(i64::MAX));

        let entries = self.storage.load_query_logs(connection_id, user_filter, before, page_size)?;
        let next_cursor = match entries.last() {
            Some(oldest) if page_size > 0 && entries.len() == page_size => Some(oldest.created_at),
            _ => None,
        };

        Ok(HistoryPage { entries, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewConnection, SshSettings};
    use crate::services::vault::Vault;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Arc<LocalStorage>, Uuid, Uuid) {
        let dir = tempdir().unwrap();
        let vault = Vault::new(&[3u8; 32]);
        let storage = Arc::new(LocalStorage::open(dir.path().to_path_buf(), vault).unwrap());
        let admin = Uuid::new_v4();
        let (connection, root) = NewConnection {
            project_id: Uuid::new_v4(),
            name: "audit".into(),
            db_type: "POSTGRES".into(),
            host: "db.internal".into(),
            port: "5432".into(),
            database: "app".into(),
            root_user: "postgres".into(),
            root_password: "pw".into(),
            login_mode: "USE_ROOT".into(),
            ssh_mode: "NONE".into(),
            ssh: SshSettings::default(),
        }
        .into_parts(admin)
        .unwrap();
        storage.insert_connection(&connection, &root).unwrap();
        (dir, storage, connection.id, admin)
    }

    #[test]
    fn test_pages_cover_history_without_gaps() {
        let (_dir, storage, conn_id, admin) = setup();
        let log = AuditLog::new(storage);
        for i in 0..7 {
            assert!(log.record(admin, conn_id, &format!("SELECT {i}")).is_some());
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = log.history(conn_id, LogScope::AllUsers, admin, cursor, 3).unwrap();
            assert!(page.entries.windows(2).all(|w| w[0].created_at > w[1].created_at));
            seen.extend(page.entries.iter().map(|e| e.query.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 7);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 7);
        assert_eq!(seen.first().map(String::as_str), Some("SELECT 6"));
        assert_eq!(seen.last().map(String::as_str), Some("SELECT 0"));
    }

    #[test]
    fn test_exact_multiple_ends_with_empty_page() {
        let (_dir, storage, conn_id, admin) = setup();
        let log = AuditLog::new(storage);
        for _ in 0..2 {
            log.record(admin, conn_id, "SELECT 1");
        }

        let first = log.history(conn_id, LogScope::AllUsers, admin, None, 2).unwrap();
        assert!(first.next_cursor.is_some());
        let second = log.history(conn_id, LogScope::AllUsers, admin, first.next_cursor, 2).unwrap();
        assert!(second.entries.is_empty());
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn test_self_scope_hides_other_users() {
        let (_dir, storage, conn_id, admin) = setup();
        let log = AuditLog::new(storage);
        let analyst = Uuid::new_v4();
        log.record(admin, conn_id, "DELETE FROM t");
        log.record(analyst, conn_id, "SELECT 1");

        let own = log.history(conn_id, LogScope::SelfOnly, analyst, None, 25).unwrap();
        assert_eq!(own.entries.len(), 1);
        assert_eq!(own.entries[0].user_id, analyst);

        let all = log.history(conn_id, LogScope::AllUsers, admin, None, 25).unwrap();
        assert_eq!(all.entries.len(), 2);
    }

    #[test]
    fn test_record_failure_is_swallowed() {
        let (_dir, storage, _conn_id, admin) = setup();
        let log = AuditLog::new(storage);
        // Unknown connection violates the foreign key.
        assert!(log.record(admin, Uuid::new_v4(), "SELECT 1").is_none());
    }
}
