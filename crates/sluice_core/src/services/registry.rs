//! Connection definitions and credential selection.

use crate::error::{SluiceError, SluiceResult};
use crate::models::{Connection, CredentialSet, LoginMode, NewConnection};
use crate::services::authz::AuthorizationGate;
use crate::services::storage::LocalStorage;

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Registry of connections and their credential sets.
#[derive(Clone)]
pub struct ConnectionRegistry {
    storage: Arc<LocalStorage>,
    gate: AuthorizationGate,
}

impl ConnectionRegistry {
    /// Create a registry over the local store.
    pub fn new(storage: Arc<LocalStorage>, gate: AuthorizationGate) -> Self {
        Self { storage, gate }
    }

    /// Validate and persist a new connection with its root credential set.
    pub fn create_connection(&self, actor: Uuid, input: NewConnection) -> SluiceResult<Connection> {
        let (connection, root) = input.into_parts(actor)?;
        self.storage.insert_connection(&connection, &root)?;

        tracing::info!(
            connection_id = %connection.id,
            project_id = %connection.project_id,
            user_id = %actor,
            ssh_mode = connection.ssh_mode.as_str(),
            login_mode = connection.login_mode.as_str(),
            "Connection created"
        );
        Ok(connection)
    }

    /// Persist edits of an existing connection.
    pub fn save_connection(&self, mut connection: Connection) -> SluiceResult<Connection> {
        connection.validate()?;
        connection.updated_at = Utc::now();
        self.storage.update_connection(&connection)?;
        Ok(connection)
    }

    /// Create or update a credential set.
    ///
    /// A connection keeps exactly one root set; non-root sets must name a role.
    pub fn save_credential_set(&self, set: CredentialSet) -> SluiceResult<CredentialSet> {
        set.validate()?;
        self.load_connection(set.connection_id)?;

        if let Some(owner) = self.storage.credential_set_owner(set.id)? {
            if owner != set.connection_id {
                tracing::warn!(
                    set_id = %set.id,
                    connection_id = %set.connection_id,
                    "Credential set save targets another connection's set"
                );
                return Err(SluiceError::not_authorized("not allowed to modify this credential set"));
            }
        }

        let existing = self.storage.load_credential_sets(set.connection_id)?;
        if let Some(current) = existing.iter().find(|s| s.id == set.id) {
            if current.is_root != set.is_root {
                return Err(SluiceError::validation("cannot change whether a credential set is root"));
            }
        } else if set.is_root {
            return Err(SluiceError::validation("connection already has a root credential set"));
        }

        self.storage.save_credential_set(&set)?;
        Ok(set)
    }

    /// Delete a connection and, by cascade, its credential sets.
    pub fn delete_connection(&self, connection_id: Uuid) -> SluiceResult<()> {
        if !self.storage.delete_connection(connection_id)? {
            return Err(SluiceError::not_found("connection", connection_id));
        }
        tracing::info!(connection_id = %connection_id, "Connection deleted");
        Ok(())
    }

    /// All connections of a project.
    pub fn list_connections(&self, project_id: Uuid) -> SluiceResult<Vec<Connection>> {
        self.storage.list_connections(project_id)
    }

    /// Load a connection or fail with `NotFound`.
    pub fn load_connection(&self, connection_id: Uuid) -> SluiceResult<Connection> {
        self.storage
            .load_connection(connection_id)?
            .ok_or_else(|| SluiceError::not_found("connection", connection_id))
    }

    /// Credential sets of a connection, root first.
    pub fn credential_sets(&self, connection_id: Uuid) -> SluiceResult<Vec<CredentialSet>> {
        self.storage.load_credential_sets(connection_id)
    }

    /// Pick the credential set the actor connects with.
    ///
    /// Resolved from current storage and membership on every call.
    pub fn resolve_connectable(
        &self,
        connection_id: Uuid,
        actor: Uuid,
    ) -> SluiceResult<(Connection, CredentialSet)> {
        let connection = self.load_connection(connection_id)?;
        let role = self.gate.require_read(actor, connection.project_id)?;
        let sets = self.storage.load_credential_sets(connection_id)?;

        let chosen = match connection.login_mode {
            LoginMode::UseRoot => sets.into_iter().find(|s| s.is_root).ok_or_else(|| {
                SluiceError::internal(format!("connection {connection_id} has no root credential set"))
            })?,
            LoginMode::RoleAccounts => {
                sets.into_iter().find(|s| !s.is_root && s.grants(actor, role)).ok_or_else(|| {
                    tracing::debug!(
                        connection_id = %connection_id,
                        user_id = %actor,
                        role = role.as_str(),
                        "No credential set granted"
                    );
                    SluiceError::not_authorized("no database account is granted to you")
                })?
            }
        };

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %actor,
            set_id = %chosen.id,
            is_root = chosen.is_root,
            "Credential set resolved"
        );
        Ok((connection, chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProjectMember, Role, SecretString, SshSettings};
    use crate::services::vault::Vault;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        storage: Arc<LocalStorage>,
        registry: ConnectionRegistry,
        project: Uuid,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let vault = Vault::from_base64(&Vault::generate_key()).unwrap();
        let storage = Arc::new(LocalStorage::open(dir.path().to_path_buf(), vault).unwrap());
        let gate = AuthorizationGate::new(storage.clone());
        let registry = ConnectionRegistry::new(storage.clone(), gate);
        Fixture { _dir: dir, storage, registry, project: Uuid::new_v4() }
    }

    fn member(f: &Fixture, role: Role) -> Uuid {
        let user = Uuid::new_v4();
        f.storage
            .set_project_member(&ProjectMember { user_id: user, project_id: f.project, role })
            .unwrap();
        user
    }

    fn create(f: &Fixture, login_mode: &str) -> Connection {
        let admin = member(f, Role::Admin);
        f.registry
            .create_connection(
                admin,
                NewConnection {
                    project_id: f.project,
                    name: "main".into(),
                    db_type: "POSTGRES".into(),
                    host: "localhost".into(),
                    port: "5432".into(),
                    database: "app".into(),
                    root_user: "root".into(),
                    root_password: "root-pw".into(),
                    login_mode: login_mode.into(),
                    ssh_mode: "NONE".into(),
                    ssh: SshSettings::default(),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_use_root_resolves_root_set() {
        let f = fixture();
        let conn = create(&f, "USE_ROOT");
        let analyst = member(&f, Role::Analyst);

        let (_, set) = f.registry.resolve_connectable(conn.id, analyst).unwrap();
        assert!(set.is_root);
        assert_eq!(set.username.expose(), "root");
    }

    #[test]
    fn test_role_accounts_resolution() {
        let f = fixture();
        let conn = create(&f, "ROLE_ACCOUNTS");
        let dev = member(&f, Role::Developer);
        let other_dev = member(&f, Role::Developer);

        // Root set exists but is never used in role-accounts mode.
        assert!(f.registry.resolve_connectable(conn.id, dev).unwrap_err().is_not_authorized());

        let set = CredentialSet::for_role(
            conn.id,
            Role::Developer,
            SecretString::new("dev_user"),
            SecretString::new("dev_pw"),
            vec![dev],
        );
        f.registry.save_credential_set(set.clone()).unwrap();

        let (_, resolved) = f.registry.resolve_connectable(conn.id, dev).unwrap();
        assert_eq!(resolved.id, set.id);
        assert_eq!(resolved.username.expose(), "dev_user");

        assert!(f.registry.resolve_connectable(conn.id, other_dev).unwrap_err().is_not_authorized());

        // Demotion takes effect on the next call.
        f.storage
            .set_project_member(&ProjectMember {
                user_id: dev,
                project_id: f.project,
                role: Role::Analyst,
            })
            .unwrap();
        assert!(f.registry.resolve_connectable(conn.id, dev).unwrap_err().is_not_authorized());
    }

    #[test]
    fn test_non_member_denied() {
        let f = fixture();
        let conn = create(&f, "USE_ROOT");
        assert!(f.registry.resolve_connectable(conn.id, Uuid::new_v4()).unwrap_err().is_not_authorized());
    }

    #[test]
    fn test_credential_set_rules() {
        let f = fixture();
        let conn = create(&f, "ROLE_ACCOUNTS");

        let second_root = CredentialSet::root(conn.id, "x".into(), "y".into());
        assert!(matches!(
            f.registry.save_credential_set(second_root),
            Err(SluiceError::Validation { .. })
        ));

        let mut roleless = CredentialSet::root(conn.id, "x".into(), "y".into());
        roleless.is_root = false;
        assert!(matches!(
            f.registry.save_credential_set(roleless),
            Err(SluiceError::Validation { .. })
        ));

        let orphan = CredentialSet::for_role(Uuid::new_v4(), Role::Analyst, "a".into(), "b".into(), vec![]);
        assert!(matches!(f.registry.save_credential_set(orphan), Err(SluiceError::NotFound { .. })));
    }

    #[test]
    fn test_set_of_another_connection_cannot_be_overwritten() {
        let f = fixture();
        let victim = create(&f, "USE_ROOT");
        let other = create(&f, "USE_ROOT");

        let mut stolen = f.registry.credential_sets(victim.id).unwrap().remove(0);
        stolen.connection_id = other.id;
        stolen.is_root = false;
        stolen.for_role = Some(Role::Analyst);
        stolen.username = SecretString::new("attacker");
        assert!(f.registry.save_credential_set(stolen).unwrap_err().is_not_authorized());

        let sets = f.registry.credential_sets(victim.id).unwrap();
        assert_eq!(sets.len(), 1);
        assert!(sets[0].is_root);
        assert_eq!(sets[0].username.expose(), "root");

        let analyst = member(&f, Role::Analyst);
        assert!(f.registry.resolve_connectable(victim.id, analyst).is_ok());
    }

    #[test]
    fn test_save_connection_reencrypts_and_validates() {
        let f = fixture();
        let mut conn = create(&f, "USE_ROOT");

        conn.host = SecretString::new("db2.internal");
        f.registry.save_connection(conn.clone()).unwrap();
        assert_eq!(f.registry.load_connection(conn.id).unwrap().host.expose(), "db2.internal");

        conn.ssh_mode = crate::models::SshMode::Password;
        assert!(matches!(f.registry.save_connection(conn), Err(SluiceError::Validation { .. })));
    }

    #[test]
    fn test_delete_connection() {
        let f = fixture();
        let conn = create(&f, "USE_ROOT");
        f.registry.delete_connection(conn.id).unwrap();
        assert!(matches!(f.registry.load_connection(conn.id), Err(SluiceError::NotFound { .. })));
        assert!(f.registry.credential_sets(conn.id).unwrap().is_empty());
        assert!(f.registry.delete_connection(conn.id).is_err());
    }
}
