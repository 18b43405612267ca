//! Local SQLite storage for gateway metadata.
//!
//! Stores connections, credential sets, project membership, the query log and
//! saved queries. Every sensitive connection field passes through the
//! [`Vault`] on write and on read; only ciphertext blobs reach the database.

use crate::error::{SluiceError, SluiceResult};
use crate::models::{
    Connection, CredentialSet, DatabaseType, LoginMode, ProjectMember, QueryLogEntry, Role,
    SavedQuery, SecretString, SshMode, SshSettings,
};
use crate::services::authz::MembershipDirectory;
use crate::services::vault::Vault;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> SluiceResult<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(SluiceError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        SluiceError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// SQLite-based local storage.
///
/// Thread-safe via internal Mutex. Uses WAL mode for concurrent reads.
pub struct LocalStorage {
    /// Thread-safe SQLite connection
    connection: Mutex<SqliteConnection>,
    /// Data directory path
    data_dir: PathBuf,
    /// Field encryptor
    vault: Vault,
}

impl LocalStorage {
    /// Open or create local storage in the given data directory.
    pub fn open(data_dir: PathBuf, vault: Vault) -> SluiceResult<Self> {
        init_data_dir(&data_dir)?;
        let db_path = data_dir.join("sluice.db");
        Self::open_with_path(db_path, data_dir, vault)
    }

    /// Open storage with a specific database path.
    pub fn open_with_path(db_path: PathBuf, data_dir: PathBuf, vault: Vault) -> SluiceResult<Self> {
        let connection = SqliteConnection::open(&db_path).map_err(|e| {
            SluiceError::storage(
                format!("Failed to open database '{}': {}", db_path.display(), e),
                Some("The database file may be corrupted. Try deleting it to start fresh."),
            )
        })?;

        Self::configure_connection(&connection)?;

        let storage = Self { connection: Mutex::new(connection), data_dir, vault };
        storage.run_migrations()?;

        tracing::info!(path = %db_path.display(), "Local storage opened");
        Ok(storage)
    }

    /// Configure SQLite connection pragmas.
    fn configure_connection(conn: &SqliteConnection) -> SluiceResult<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA cache_size = -64000;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .map_err(|e| SluiceError::storage(format!("Failed to configure database: {e}"), None))
    }

    /// Run database migrations.
    fn run_migrations(&self) -> SluiceResult<()> {
        let conn = self.connection.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )
        .map_err(|e| SluiceError::storage(format!("Failed to create migrations table: {e}"), None))?;

        self.migrate_schema(&conn)
    }

    /// Run schema migrations for the gateway domain.
    fn migrate_schema(&self, conn: &SqliteConnection) -> SluiceResult<()> {
        const DOMAIN: &str = "gateway";

        let current_step: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
                [DOMAIN],
                |row| row.get(0),
            )
            .map_err(|e| SluiceError::storage(format!("Failed to read migration level: {e}"), None))?;

        if current_step < 1 {
            conn.execute_batch(
                "
                -- Connections (sensitive columns hold vault blobs)
                CREATE TABLE connections (
                    connection_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    db_type TEXT NOT NULL,
                    host TEXT NOT NULL,
                    port TEXT NOT NULL,
                    database_name TEXT NOT NULL,
                    login_mode TEXT NOT NULL,
                    ssh_mode TEXT NOT NULL,
                    ssh_host TEXT NOT NULL,
                    ssh_user TEXT NOT NULL,
                    ssh_password TEXT NOT NULL,
                    ssh_key TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                ) STRICT;

                -- Credential sets (username/password hold vault blobs)
                CREATE TABLE credential_sets (
                    set_id TEXT PRIMARY KEY,
                    connection_id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    password TEXT NOT NULL,
                    is_root INTEGER NOT NULL DEFAULT 0,
                    for_role TEXT,
                    user_ids TEXT NOT NULL DEFAULT '[]',
                    FOREIGN KEY(connection_id) REFERENCES connections(connection_id) ON DELETE CASCADE
                ) STRICT;

                -- Project membership
                CREATE TABLE project_members (
                    user_id TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    PRIMARY KEY(user_id, project_id)
                ) STRICT;

                -- Query log (created_at is unix nanoseconds, strictly increasing)
                CREATE TABLE query_logs (
                    log_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    connection_id TEXT NOT NULL,
                    query_text TEXT NOT NULL,
                    created_at INTEGER NOT NULL UNIQUE,
                    FOREIGN KEY(connection_id) REFERENCES connections(connection_id) ON DELETE CASCADE
                ) STRICT;

                -- Saved queries
                CREATE TABLE saved_queries (
                    query_id TEXT PRIMARY KEY,
                    connection_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    query_text TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY(connection_id) REFERENCES connections(connection_id) ON DELETE CASCADE
                ) STRICT;

                -- Indexes
                CREATE INDEX idx_connections_project ON connections(project_id, name);
                CREATE INDEX idx_credential_sets_connection ON credential_sets(connection_id);
                CREATE UNIQUE INDEX idx_credential_sets_root ON credential_sets(connection_id) WHERE is_root = 1;
                CREATE INDEX idx_query_logs_connection ON query_logs(connection_id, created_at DESC);
                CREATE INDEX idx_saved_queries_connection ON saved_queries(connection_id, name);
                ",
            )
            .map_err(|e| SluiceError::storage(format!("Migration 1 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'initial_schema')",
                [DOMAIN],
            )
            .map_err(|e| SluiceError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 1: initial_schema");
        }

        if current_step < 2 {
            // Log rows outlive their connection; drop the cascading foreign key.
            conn.execute_batch(
                "
                CREATE TABLE query_logs_detached (
                    log_id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    connection_id TEXT NOT NULL,
                    query_text TEXT NOT NULL,
                    created_at INTEGER NOT NULL UNIQUE
                ) STRICT;
                INSERT INTO query_logs_detached SELECT log_id, user_id, connection_id, query_text, created_at FROM query_logs;
                DROP TABLE query_logs;
                ALTER TABLE query_logs_detached RENAME TO query_logs;
                CREATE INDEX idx_query_logs_connection ON query_logs(connection_id, created_at DESC);
                ",
            )
            .map_err(|e| SluiceError::storage(format!("Migration 2 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 2, 'detach_query_logs')",
                [DOMAIN],
            )
            .map_err(|e| SluiceError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 2: detach_query_logs");
        }

        Ok(())
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ========== Connection Operations ==========

    /// Insert a new connection together with its root credential set.
    ///
    /// Both rows are written in one transaction.
    pub fn insert_connection(
        &self,
        connection: &Connection,
        root: &CredentialSet,
    ) -> SluiceResult<()> {
        let row = self.encrypt_connection(connection)?;
        let set = self.encrypt_credential_set(root)?;

        let mut conn = self.connection.lock();
        let tx = conn
            .transaction()
            .map_err(|e| SluiceError::storage(format!("Failed to begin transaction: {e}"), None))?;

        tx.execute(
            "INSERT INTO connections (
                connection_id, name, created_by, project_id, db_type,
                host, port, database_name, login_mode, ssh_mode,
                ssh_host, ssh_user, ssh_password, ssh_key, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                row.id,
                row.name,
                row.created_by,
                row.project_id,
                row.db_type,
                row.host,
                row.port,
                row.database,
                row.login_mode,
                row.ssh_mode,
                row.ssh_host,
                row.ssh_user,
                row.ssh_password,
                row.ssh_key,
                row.created_at,
                row.updated_at,
            ],
        )
        .map_err(|e| SluiceError::storage(format!("Failed to insert connection: {e}"), None))?;

        Self::upsert_credential_set_row(&tx, &set)?;

        tx.commit()
            .map_err(|e| SluiceError::storage(format!("Failed to commit connection: {e}"), None))?;

        tracing::debug!(connection_id = %connection.id, name = %connection.name, "Connection created");
        Ok(())
    }

    /// Persist in-place edits of an existing connection.
    pub fn update_connection(&self, connection: &Connection) -> SluiceResult<()> {
        let row = self.encrypt_connection(connection)?;
        let conn = self.connection.lock();

        let updated = conn
            .execute(
                "UPDATE connections SET
                    name = ?2, db_type = ?3, host = ?4, port = ?5, database_name = ?6,
                    login_mode = ?7, ssh_mode = ?8, ssh_host = ?9, ssh_user = ?10,
                    ssh_password = ?11, ssh_key = ?12, updated_at = ?13
                 WHERE connection_id = ?1",
                params![
                    row.id,
                    row.name,
                    row.db_type,
                    row.host,
                    row.port,
                    row.database,
                    row.login_mode,
                    row.ssh_mode,
                    row.ssh_host,
                    row.ssh_user,
                    row.ssh_password,
                    row.ssh_key,
                    row.updated_at,
                ],
            )
            .map_err(|e| SluiceError::storage(format!("Failed to save connection: {e}"), None))?;

        if updated == 0 {
            return Err(SluiceError::not_found("connection", connection.id));
        }

        tracing::debug!(connection_id = %connection.id, "Connection saved");
        Ok(())
    }

    /// Load a connection by ID.
    pub fn load_connection(&self, id: Uuid) -> SluiceResult<Option<Connection>> {
        let row = {
            let conn = self.connection.lock();
            conn.query_row(
                &format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE connection_id = ?"),
                [id.to_string()],
                ConnectionRow::from_sql_row,
            )
            .optional()
            .map_err(|e| SluiceError::storage(format!("Failed to load connection: {e}"), None))?
        };

        row.map(|row| self.decrypt_connection(row)).transpose()
    }

    /// Load all connections of a project, ordered by name.
    pub fn list_connections(&self, project_id: Uuid) -> SluiceResult<Vec<Connection>> {
        let rows = {
            let conn = self.connection.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CONNECTION_COLUMNS} FROM connections WHERE project_id = ? ORDER BY name"
                ))
                .map_err(|e| SluiceError::storage(format!("Failed to prepare query: {e}"), None))?;

            let rows = stmt
                .query_map([project_id.to_string()], ConnectionRow::from_sql_row)
                .map_err(|e| {
                    SluiceError::storage(format!("Failed to query connections: {e}"), None)
                })?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| SluiceError::storage(format!("Failed to read connections: {e}"), None))?
        };

        rows.into_iter().map(|row| self.decrypt_connection(row)).collect()
    }

    /// Delete a connection. Credential sets and saved queries cascade; its
    /// query log is kept.
    pub fn delete_connection(&self, id: Uuid) -> SluiceResult<bool> {
        let conn = self.connection.lock();

        let deleted = conn
            .execute("DELETE FROM connections WHERE connection_id = ?", [id.to_string()])
            .map_err(|e| SluiceError::storage(format!("Failed to delete connection: {e}"), None))?;

        tracing::debug!(connection_id = %id, deleted = deleted > 0, "Connection deleted");
        Ok(deleted > 0)
    }

    // ========== Credential Set Operations ==========

    /// Insert or update a credential set by ID.
    pub fn save_credential_set(&self, set: &CredentialSet) -> SluiceResult<()> {
        let row = self.encrypt_credential_set(set)?;
        let conn = self.connection.lock();
        if !Self::upsert_credential_set_row(&conn, &row)? {
            return Err(SluiceError::validation("credential set belongs to another connection"));
        }

        tracing::debug!(
            set_id = %set.id,
            connection_id = %set.connection_id,
            is_root = set.is_root,
            "Credential set saved"
        );
        Ok(())
    }

    /// Returns false when the id is already taken by another connection's set.
    fn upsert_credential_set_row(conn: &SqliteConnection, row: &CredentialSetRow) -> SluiceResult<bool> {
        let changed = conn.execute(
            "INSERT INTO credential_sets (set_id, connection_id, username, password, is_root, for_role, user_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(set_id) DO UPDATE SET
                username = excluded.username,
                password = excluded.password,
                is_root = excluded.is_root,
                for_role = excluded.for_role,
                user_ids = excluded.user_ids
             WHERE credential_sets.connection_id = excluded.connection_id",
            params![
                row.id,
                row.connection_id,
                row.username,
                row.password,
                row.is_root,
                row.for_role,
                row.user_ids,
            ],
        )
        .map_err(|e| SluiceError::storage(format!("Failed to save credential set: {e}"), None))?;
        Ok(changed > 0)
    }

    /// Load every credential set of a connection, root first.
    pub fn load_credential_sets(&self, connection_id: Uuid) -> SluiceResult<Vec<CredentialSet>> {
        let rows = {
            let conn = self.connection.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT set_id, connection_id, username, password, is_root, for_role, user_ids
                     FROM credential_sets WHERE connection_id = ?
                     ORDER BY is_root DESC, set_id",
                )
                .map_err(|e| SluiceError::storage(format!("Failed to prepare query: {e}"), None))?;

            let rows = stmt
                .query_map([connection_id.to_string()], |row| {
                    Ok(CredentialSetRow {
                        id: row.get(0)?,
                        connection_id: row.get(1)?,
                        username: row.get(2)?,
                        password: row.get(3)?,
                        is_root: row.get(4)?,
                        for_role: row.get(5)?,
                        user_ids: row.get(6)?,
                    })
                })
                .map_err(|e| {
                    SluiceError::storage(format!("Failed to query credential sets: {e}"), None)
                })?;

            rows.collect::<Result<Vec<_>, _>>().map_err(|e| {
                SluiceError::storage(format!("Failed to read credential sets: {e}"), None)
            })?
        };

        rows.into_iter().map(|row| self.decrypt_credential_set(row)).collect()
    }

    /// Connection that owns a credential set, if the set exists.
    pub fn credential_set_owner(&self, set_id: Uuid) -> SluiceResult<Option<Uuid>> {
        let owner: Option<String> = {
            let conn = self.connection.lock();
            conn.query_row(
                "SELECT connection_id FROM credential_sets WHERE set_id = ?",
                [set_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SluiceError::storage(format!("Failed to load credential set: {e}"), None))?
        };

        owner.map(|id| parse_uuid(&id, "connection_id")).transpose()
    }

    // ========== Project Membership Operations ==========

    /// Grant or change a user's role in a project.
    pub fn set_project_member(&self, member: &ProjectMember) -> SluiceResult<()> {
        let conn = self.connection.lock();

        conn.execute(
            "INSERT INTO project_members (user_id, project_id, role) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, project_id) DO UPDATE SET role = excluded.role",
            params![member.user_id.to_string(), member.project_id.to_string(), member.role.as_str()],
        )
        .map_err(|e| SluiceError::storage(format!("Failed to save project member: {e}"), None))?;

        tracing::debug!(
            user_id = %member.user_id,
            project_id = %member.project_id,
            role = member.role.as_str(),
            "Project member saved"
        );
        Ok(())
    }

    /// Remove a user from a project.
    pub fn remove_project_member(&self, user_id: Uuid, project_id: Uuid) -> SluiceResult<()> {
        let conn = self.connection.lock();

        conn.execute(
            "DELETE FROM project_members WHERE user_id = ? AND project_id = ?",
            params![user_id.to_string(), project_id.to_string()],
        )
        .map_err(|e| SluiceError::storage(format!("Failed to remove project member: {e}"), None))?;

        Ok(())
    }

    // ========== Query Log Operations ==========

    /// Append a query log entry, assigning its strictly increasing timestamp.
    ///
    /// The stored `created_at` is `max(now, last + 1ns)`, so entries never
    /// share a timestamp even when written within the same clock tick.
    pub fn append_query_log(&self, entry: &QueryLogEntry) -> SluiceResult<QueryLogEntry> {
        let conn = self.connection.lock();

        let last: Option<i64> = conn
            .query_row("SELECT MAX(created_at) FROM query_logs", [], |row| row.get(0))
            .map_err(|e| SluiceError::storage(format!("Failed to read query log: {e}"), None))?;

        let now = to_nanos(Utc::now())?;
        let created_at = match last {
            Some(last) if last >= now => last + 1,
            _ => now,
        };

        let inserted = conn
            .execute(
                "INSERT INTO query_logs (log_id, user_id, connection_id, query_text, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5
                 WHERE EXISTS (SELECT 1 FROM connections WHERE connection_id = ?3)",
                params![
                    entry.id.to_string(),
                    entry.user_id.to_string(),
                    entry.connection_id.to_string(),
                    entry.query,
                    created_at,
                ],
            )
            .map_err(|e| SluiceError::storage(format!("Failed to append query log: {e}"), None))?;
        if inserted == 0 {
            return Err(SluiceError::not_found("connection", entry.connection_id));
        }

        tracing::trace!(log_id = %entry.id, connection_id = %entry.connection_id, "Query logged");
        Ok(QueryLogEntry { created_at: from_nanos(created_at), ..entry.clone() })
    }

    /// Load log entries of a connection strictly older than `before`, newest first.
    ///
    /// With `user_id` set only that user's entries are returned.
    pub fn load_query_logs(
        &self,
        connection_id: Uuid,
        user_id: Option<Uuid>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> SluiceResult<Vec<QueryLogEntry>> {
        let before = to_nanos(before)?;
        let conn = self.connection.lock();

        let mut stmt = if user_id.is_some() {
            conn.prepare(
                "SELECT log_id, user_id, connection_id, query_text, created_at
                 FROM query_logs
                 WHERE connection_id = ? AND created_at < ? AND user_id = ?
                 ORDER BY created_at DESC
                 LIMIT ?",
            )
            .map_err(|e| SluiceError::storage(format!("Failed to prepare query: {e}"), None))?
        } else {
            conn.prepare(
                "SELECT log_id, user_id, connection_id, query_text, created_at
                 FROM query_logs
                 WHERE connection_id = ? AND created_at < ?
                 ORDER BY created_at DESC
                 LIMIT ?",
            )
            .map_err(|e| SluiceError::storage(format!("Failed to prepare query: {e}"), None))?
        };

        let rows = if let Some(user_id) = user_id {
            Self::query_log_rows(
                &mut stmt,
                params![connection_id.to_string(), before, user_id.to_string(), limit as i64],
            )?
        } else {
            Self::query_log_rows(&mut stmt, params![connection_id.to_string(), before, limit as i64])?
        };

        rows.into_iter()
            .map(|(id, user_id, connection_id, query, created_at)| {
                Ok(QueryLogEntry {
                    id: parse_uuid(&id, "log")?,
                    user_id: parse_uuid(&user_id, "user")?,
                    connection_id: parse_uuid(&connection_id, "connection")?,
                    query,
                    created_at: from_nanos(created_at),
                })
            })
            .collect()
    }

    fn query_log_rows(
        stmt: &mut rusqlite::Statement,
        params: impl rusqlite::Params,
    ) -> SluiceResult<Vec<(String, String, String, String, i64)>> {
        let rows = stmt
            .query_map(params, |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .map_err(|e| SluiceError::storage(format!("Failed to query log: {e}"), None))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| SluiceError::storage(format!("Failed to read log: {e}"), None))
    }

    // ========== Saved Queries Operations ==========

    /// Insert or update a saved query.
    pub fn save_query(&self, query: &SavedQuery) -> SluiceResult<()> {
        let conn = self.connection.lock();

        conn.execute(
            "INSERT INTO saved_queries (query_id, connection_id, name, query_text, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(query_id) DO UPDATE SET
                name = excluded.name,
                query_text = excluded.query_text,
                updated_at = excluded.updated_at",
            params![
                query.id.to_string(),
                query.connection_id.to_string(),
                query.name,
                query.query,
                query.created_by.to_string(),
                query.created_at.to_rfc3339(),
                query.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| SluiceError::storage(format!("Failed to save query: {e}"), None))?;

        tracing::debug!(query_id = %query.id, name = %query.name, "Query saved");
        Ok(())
    }

    /// Load a saved query by ID.
    pub fn load_saved_query(&self, id: Uuid) -> SluiceResult<Option<SavedQuery>> {
        let conn = self.connection.lock();

        let row = conn
            .query_row(
                "SELECT query_id, connection_id, name, query_text, created_by, created_at, updated_at
                 FROM saved_queries WHERE query_id = ?",
                [id.to_string()],
                SavedQueryRow::from_sql_row,
            )
            .optional()
            .map_err(|e| SluiceError::storage(format!("Failed to load saved query: {e}"), None))?;

        row.map(SavedQueryRow::into_saved_query).transpose()
    }

    /// Load every saved query of a connection, ordered by name.
    pub fn list_saved_queries(&self, connection_id: Uuid) -> SluiceResult<Vec<SavedQuery>> {
        let conn = self.connection.lock();

        let mut stmt = conn
            .prepare(
                "SELECT query_id, connection_id, name, query_text, created_by, created_at, updated_at
                 FROM saved_queries WHERE connection_id = ? ORDER BY name, query_id",
            )
            .map_err(|e| SluiceError::storage(format!("Failed to prepare query: {e}"), None))?;

        let rows = stmt
            .query_map([connection_id.to_string()], SavedQueryRow::from_sql_row)
            .map_err(|e| SluiceError::storage(format!("Failed to query saved queries: {e}"), None))?;

        let rows = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SluiceError::storage(format!("Failed to read saved queries: {e}"), None))?;

        rows.into_iter().map(SavedQueryRow::into_saved_query).collect()
    }

    // ========== Helper Methods ==========

    fn seal(&self, value: &SecretString) -> SluiceResult<String> {
        self.vault.encrypt(value.expose())
    }

    fn open_field(&self, blob: &str) -> SluiceResult<SecretString> {
        self.vault.decrypt(blob).map(SecretString::from)
    }

    fn encrypt_connection(&self, connection: &Connection) -> SluiceResult<ConnectionRow> {
        Ok(ConnectionRow {
            id: connection.id.to_string(),
            name: connection.name.clone(),
            created_by: connection.created_by.to_string(),
            project_id: connection.project_id.to_string(),
            db_type: connection.db_type.as_str().to_string(),
            host: self.seal(&connection.host)?,
            port: self.seal(&connection.port)?,
            database: self.seal(&connection.database)?,
            login_mode: connection.login_mode.as_str().to_string(),
            ssh_mode: connection.ssh_mode.as_str().to_string(),
            ssh_host: self.seal(&connection.ssh.host)?,
            ssh_user: self.seal(&connection.ssh.user)?,
            ssh_password: self.seal(&connection.ssh.password)?,
            ssh_key: self.seal(&connection.ssh.key)?,
            created_at: connection.created_at.to_rfc3339(),
            updated_at: connection.updated_at.to_rfc3339(),
        })
    }

    fn decrypt_connection(&self, row: ConnectionRow) -> SluiceResult<Connection> {
        Ok(Connection {
            id: parse_uuid(&row.id, "connection")?,
            name: row.name,
            created_by: parse_uuid(&row.created_by, "user")?,
            project_id: parse_uuid(&row.project_id, "project")?,
            db_type: DatabaseType::parse(&row.db_type).map_err(stored_enum)?,
            host: self.open_field(&row.host)?,
            port: self.open_field(&row.port)?,
            database: self.open_field(&row.database)?,
            login_mode: LoginMode::parse(&row.login_mode).map_err(stored_enum)?,
            ssh_mode: SshMode::parse(&row.ssh_mode).map_err(stored_enum)?,
            ssh: SshSettings {
                host: self.open_field(&row.ssh_host)?,
                user: self.open_field(&row.ssh_user)?,
                password: self.open_field(&row.ssh_password)?,
                key: self.open_field(&row.ssh_key)?,
            },
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }

    fn encrypt_credential_set(&self, set: &CredentialSet) -> SluiceResult<CredentialSetRow> {
        Ok(CredentialSetRow {
            id: set.id.to_string(),
            connection_id: set.connection_id.to_string(),
            username: self.seal(&set.username)?,
            password: self.seal(&set.password)?,
            is_root: set.is_root,
            for_role: set.for_role.map(|r| r.as_str().to_string()),
            user_ids: serde_json::to_string(&set.user_ids)?,
        })
    }

    fn decrypt_credential_set(&self, row: CredentialSetRow) -> SluiceResult<CredentialSet> {
        Ok(CredentialSet {
            id: parse_uuid(&row.id, "credential set")?,
            connection_id: parse_uuid(&row.connection_id, "connection")?,
            username: self.open_field(&row.username)?,
            password: self.open_field(&row.password)?,
            is_root: row.is_root,
            for_role: row.for_role.as_deref().map(Role::parse).transpose().map_err(stored_enum)?,
            user_ids: serde_json::from_str(&row.user_ids)?,
        })
    }
}

impl MembershipDirectory for LocalStorage {
    fn role_of(&self, user_id: Uuid, project_id: Uuid) -> SluiceResult<Option<Role>> {
        let conn = self.connection.lock();

        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM project_members WHERE user_id = ? AND project_id = ?",
                params![user_id.to_string(), project_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SluiceError::storage(format!("Failed to load project member: {e}"), None))?;

        role.as_deref().map(Role::parse).transpose().map_err(stored_enum)
    }
}

const CONNECTION_COLUMNS: &str = "connection_id, name, created_by, project_id, db_type,
    host, port, database_name, login_mode, ssh_mode,
    ssh_host, ssh_user, ssh_password, ssh_key, created_at, updated_at";

/// Internal struct for connection rows as stored (sensitive fields encrypted).
struct ConnectionRow {
    id: String,
    name: String,
    created_by: String,
    project_id: String,
    db_type: String,
    host: String,
    port: String,
    database: String,
    login_mode: String,
    ssh_mode: String,
    ssh_host: String,
    ssh_user: String,
    ssh_password: String,
    ssh_key: String,
    created_at: String,
    updated_at: String,
}

impl ConnectionRow {
    fn from_sql_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            created_by: row.get(2)?,
            project_id: row.get(3)?,
            db_type: row.get(4)?,
            host: row.get(5)?,
            port: row.get(6)?,
            database: row.get(7)?,
            login_mode: row.get(8)?,
            ssh_mode: row.get(9)?,
            ssh_host: row.get(10)?,
            ssh_user: row.get(11)?,
            ssh_password: row.get(12)?,
            ssh_key: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}

/// Internal struct for credential set rows as stored.
struct CredentialSetRow {
    id: String,
    connection_id: String,
    username: String,
    password: String,
    is_root: bool,
    for_role: Option<String>,
    user_ids: String,
}

/// Internal struct for saved query rows as stored.
struct SavedQueryRow {
    id: String,
    connection_id: String,
    name: String,
    query: String,
    created_by: String,
    created_at: String,
    updated_at: String,
}

impl SavedQueryRow {
    fn from_sql_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            connection_id: row.get(1)?,
            name: row.get(2)?,
            query: row.get(3)?,
            created_by: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_saved_query(self) -> SluiceResult<SavedQuery> {
        Ok(SavedQuery {
            id: parse_uuid(&self.id, "saved query")?,
            connection_id: parse_uuid(&self.connection_id, "connection")?,
            name: self.name,
            query: self.query,
            created_by: parse_uuid(&self.created_by, "user")?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_uuid(value: &str, what: &str) -> SluiceResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| SluiceError::storage(format!("Invalid {what} ID '{value}': {e}"), None))
}

fn parse_timestamp(value: &str) -> SluiceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SluiceError::storage(format!("Invalid timestamp '{value}': {e}"), None))
}

fn stored_enum(err: SluiceError) -> SluiceError {
    SluiceError::storage(format!("Corrupt stored value: {err}"), None)
}

fn to_nanos(at: DateTime<Utc>) -> SluiceResult<i64> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| SluiceError::validation(format!("timestamp {at} is out of range")))
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}
