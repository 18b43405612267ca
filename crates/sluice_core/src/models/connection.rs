//! Connection definitions and credential sets.

use crate::error::{SluiceError, SluiceResult};
use crate::models::project::Role;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default SSH port when `ssh_host` carries no explicit port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// In-memory holder for a decrypted sensitive field.
///
/// Never printed by `Debug` and never serialized; the store encrypts it
/// through the vault on every write.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a cleartext value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the cleartext value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check whether the value is empty after trimming.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatabaseType {
    /// PostgreSQL
    Postgres,
}

impl DatabaseType {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "POSTGRES",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> SluiceResult<Self> {
        match s.trim().to_uppercase().as_str() {
            "POSTGRES" | "POSTGRESQL" => Ok(Self::Postgres),
            other => Err(SluiceError::validation(format!("unknown database type '{other}'"))),
        }
    }
}

/// Which credential sets apply to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginMode {
    /// Every member connects with the single root credential set.
    #[serde(rename = "USE_ROOT")]
    UseRoot,
    /// Members connect with the set granted to their project role.
    #[serde(rename = "ROLE_ACCOUNTS")]
    RoleAccounts,
}

impl LoginMode {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseRoot => "USE_ROOT",
            Self::RoleAccounts => "ROLE_ACCOUNTS",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> SluiceResult<Self> {
        match s {
            "USE_ROOT" => Ok(Self::UseRoot),
            "ROLE_ACCOUNTS" => Ok(Self::RoleAccounts),
            other => Err(SluiceError::validation(format!("login mode '{other}' is not correct"))),
        }
    }
}

/// How the connection reaches the database host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SshMode {
    /// Direct connection, no tunnel.
    #[serde(rename = "NONE")]
    None,
    /// Tunnel authenticated by password.
    #[serde(rename = "PASSWORD")]
    Password,
    /// Tunnel authenticated by private key.
    #[serde(rename = "KEYFILE")]
    Keyfile,
    /// Tunnel authenticated by private key, with the password as its passphrase.
    #[serde(rename = "PASSKEYFILE")]
    PasswordAndKeyfile,
}

impl SshMode {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Password => "PASSWORD",
            Self::Keyfile => "KEYFILE",
            Self::PasswordAndKeyfile => "PASSKEYFILE",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> SluiceResult<Self> {
        match s {
            "NONE" => Ok(Self::None),
            "PASSWORD" => Ok(Self::Password),
            "KEYFILE" => Ok(Self::Keyfile),
            "PASSKEYFILE" | "PASSWORD_AND_KEYFILE" => Ok(Self::PasswordAndKeyfile),
            other => Err(SluiceError::validation(format!("SSH mode '{other}' is not correct"))),
        }
    }

    /// Whether a tunnel is required.
    pub fn uses_tunnel(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether the SSH password must be present.
    pub fn requires_password(&self) -> bool {
        matches!(self, Self::Password | Self::PasswordAndKeyfile)
    }

    /// Whether the SSH private key must be present.
    pub fn requires_key(&self) -> bool {
        matches!(self, Self::Keyfile | Self::PasswordAndKeyfile)
    }
}

/// SSH settings of a connection (decrypted).
#[derive(Debug, Clone, Default)]
pub struct SshSettings {
    /// SSH server, `host` or `host:port`
    pub host: SecretString,
    /// SSH login user
    pub user: SecretString,
    /// SSH password, or key passphrase in `PasswordAndKeyfile` mode
    pub password: SecretString,
    /// OpenSSH private key material
    pub key: SecretString,
}

impl SshSettings {
    /// Split `host` into host name and port.
    pub fn address(&self) -> SluiceResult<(String, u16)> {
        split_host_port(self.host.expose(), DEFAULT_SSH_PORT)
    }
}

/// A stored remote database target.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// User who created the connection
    pub created_by: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Engine type
    pub db_type: DatabaseType,
    /// Database host
    pub host: SecretString,
    /// Database port (kept as text, validated as u16)
    pub port: SecretString,
    /// Database name
    pub database: SecretString,
    /// Credential selection mode
    pub login_mode: LoginMode,
    /// Tunnel mode
    pub ssh_mode: SshMode,
    /// Tunnel settings
    pub ssh: SshSettings,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Parsed database port.
    pub fn port_number(&self) -> SluiceResult<u16> {
        parse_port(self.port.expose())
    }

    /// Check the SSH/required-field invariants.
    pub fn validate(&self) -> SluiceResult<()> {
        if self.name.trim().is_empty() {
            return Err(SluiceError::validation("name cannot be empty"));
        }
        for (field, value) in
            [("host", &self.host), ("port", &self.port), ("database name", &self.database)]
        {
            if value.is_blank() {
                return Err(SluiceError::validation(format!("{field} cannot be empty")));
            }
        }
        self.port_number()?;

        if self.ssh_mode.uses_tunnel() {
            if self.ssh.host.is_blank() {
                return Err(SluiceError::validation("SSH host cannot be empty"));
            }
            if self.ssh.user.is_blank() {
                return Err(SluiceError::validation("SSH user cannot be empty"));
            }
            self.ssh.address()?;
        }
        if self.ssh_mode.requires_password() && self.ssh.password.is_blank() {
            return Err(SluiceError::validation("SSH password cannot be empty"));
        }
        if self.ssh_mode.requires_key() && self.ssh.key.is_blank() {
            return Err(SluiceError::validation("SSH key file cannot be empty"));
        }
        Ok(())
    }
}

/// One username/password pair bound to a connection.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    /// Unique identifier
    pub id: Uuid,
    /// Owning connection
    pub connection_id: Uuid,
    /// Database user
    pub username: SecretString,
    /// Database password
    pub password: SecretString,
    /// Whether this is the connection's root set
    pub is_root: bool,
    /// Project role this set serves (role accounts only)
    pub for_role: Option<Role>,
    /// Users explicitly granted this set
    pub user_ids: Vec<Uuid>,
}

impl CredentialSet {
    /// Create the root set for a connection.
    pub fn root(connection_id: Uuid, username: SecretString, password: SecretString) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            username,
            password,
            is_root: true,
            for_role: None,
            user_ids: Vec::new(),
        }
    }

    /// Create a role set granted to the given users.
    pub fn for_role(
        connection_id: Uuid,
        role: Role,
        username: SecretString,
        password: SecretString,
        user_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            username,
            password,
            is_root: false,
            for_role: Some(role),
            user_ids,
        }
    }

    /// Whether this set serves the actor with the given role.
    pub fn grants(&self, actor: Uuid, role: Role) -> bool {
        self.for_role == Some(role) && self.user_ids.contains(&actor)
    }

    /// Check the shape invariants of a set.
    pub fn validate(&self) -> SluiceResult<()> {
        if self.username.is_blank() || self.password.is_blank() {
            return Err(SluiceError::validation("database user and password cannot be empty"));
        }
        if !self.is_root && self.for_role.is_none() {
            return Err(SluiceError::validation("non-root credential sets need a role"));
        }
        Ok(())
    }
}

/// Cleartext input for creating a connection.
///
/// Enumerants arrive as strings and are validated on creation.
#[derive(Debug, Clone, Default)]
pub struct NewConnection {
    /// Owning project
    pub project_id: Uuid,
    /// Display name
    pub name: String,
    /// Engine type (e.g. "POSTGRES")
    pub db_type: String,
    /// Database host
    pub host: String,
    /// Database port
    pub port: String,
    /// Database name
    pub database: String,
    /// Root database user
    pub root_user: String,
    /// Root database password
    pub root_password: SecretString,
    /// "USE_ROOT" or "ROLE_ACCOUNTS"
    pub login_mode: String,
    /// "NONE", "PASSWORD", "KEYFILE" or "PASSKEYFILE"
    pub ssh_mode: String,
    /// Tunnel settings
    pub ssh: SshSettings,
}

impl NewConnection {
    /// Validate and convert into a connection plus its root credential set.
    pub fn into_parts(self, created_by: Uuid) -> SluiceResult<(Connection, CredentialSet)> {
        let ssh_mode = SshMode::parse(&self.ssh_mode)?;
        let login_mode = LoginMode::parse(&self.login_mode)?;
        let db_type = DatabaseType::parse(&self.db_type)?;

        if self.root_user.trim().is_empty() || self.root_password.is_blank() {
            return Err(SluiceError::validation("database user and password cannot be empty"));
        }

        let now = Utc::now();
        let connection = Connection {
            id: Uuid::new_v4(),
            name: self.name,
            created_by,
            project_id: self.project_id,
            db_type,
            host: self.host.into(),
            port: self.port.into(),
            database: self.database.into(),
            login_mode,
            ssh_mode,
            ssh: self.ssh,
            created_at: now,
            updated_at: now,
        };
        connection.validate()?;

        let root =
            CredentialSet::root(connection.id, SecretString::new(self.root_user), self.root_password);
        Ok((connection, root))
    }
}

/// Parse a port number.
pub fn parse_port(value: &str) -> SluiceResult<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| SluiceError::validation(format!("port '{value}' is not a valid port number")))
}

/// Split `host` or `host:port` (IPv6 literals in brackets) into parts.
pub fn split_host_port(value: &str, default_port: u16) -> SluiceResult<(String, u16)> {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| SluiceError::validation(format!("malformed host '{value}'")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port)?)),
        _ => Ok((value.to_string(), default_port)),
    }
}
