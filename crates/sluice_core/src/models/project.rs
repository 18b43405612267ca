//! Project membership and roles.

use crate::error::{SluiceError, SluiceResult};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Project-scoped permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Full control, sees every member's history
    Admin,
    /// May read and mutate data
    Developer,
    /// Read-only
    Analyst,
}

impl Role {
    /// All roles.
    pub const ALL: [Role; 3] = [Role::Admin, Role::Developer, Role::Analyst];

    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Developer => "DEVELOPER",
            Self::Analyst => "ANALYST",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> SluiceResult<Self> {
        match s {
            "ADMIN" => Ok(Self::Admin),
            "DEVELOPER" => Ok(Self::Developer),
            "ANALYST" => Ok(Self::Analyst),
            other => Err(SluiceError::validation(format!("unknown role '{other}'"))),
        }
    }

    /// Whether the role may change remote data.
    pub fn can_mutate(&self) -> bool {
        matches!(self, Self::Admin | Self::Developer)
    }
}

/// A user's role in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMember {
    /// Member user
    pub user_id: Uuid,
    /// Project
    pub project_id: Uuid,
    /// Role held in the project
    pub role: Role,
}

/// Whose query history an actor may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogScope {
    /// Every member's entries
    AllUsers,
    /// Only the actor's own entries
    SelfOnly,
}
