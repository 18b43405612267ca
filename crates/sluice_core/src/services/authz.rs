//! Role-based authorization decisions.
//!
//! Roles are looked up on every call; nothing is cached between requests.

use crate::error::{SluiceError, SluiceResult};
use crate::models::{LogScope, Role};

use std::sync::Arc;
use uuid::Uuid;

/// Source of project membership.
pub trait MembershipDirectory: Send + Sync {
    /// The actor's role in the project, or `None` when not a member.
    fn role_of(&self, user_id: Uuid, project_id: Uuid) -> SluiceResult<Option<Role>>;
}

/// Gate for read, mutate and history-visibility decisions.
#[derive(Clone)]
pub struct AuthorizationGate {
    directory: Arc<dyn MembershipDirectory>,
}

impl AuthorizationGate {
    /// Create a gate over a membership directory.
    pub fn new(directory: Arc<dyn MembershipDirectory>) -> Self {
        Self { directory }
    }

    /// Current role of the actor in the project.
    pub fn role(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<Option<Role>> {
        self.directory.role_of(actor, project_id)
    }

    /// Whether the actor may read data in the project.
    pub fn can_read(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<bool> {
        Ok(self.role(actor, project_id)?.is_some())
    }

    /// Whether the actor may mutate data in the project.
    pub fn can_mutate(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<bool> {
        Ok(self.role(actor, project_id)?.is_some_and(|r| r.can_mutate()))
    }

    /// Whose history the actor may see.
    pub fn visible_log_scope(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<LogScope> {
        Ok(match self.role(actor, project_id)? {
            Some(Role::Admin) => LogScope::AllUsers,
            _ => LogScope::SelfOnly,
        })
    }

    /// Require membership, returning the role.
    pub fn require_read(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<Role> {
        self.role(actor, project_id)?.ok_or_else(|| {
            tracing::debug!(user_id = %actor, project_id = %project_id, "Read denied");
            SluiceError::not_authorized("not allowed to access this connection")
        })
    }

    /// Require a role that may mutate data.
    pub fn require_mutate(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<Role> {
        match self.role(actor, project_id)? {
            Some(role) if role.can_mutate() => Ok(role),
            _ => {
                tracing::debug!(user_id = %actor, project_id = %project_id, "Mutation denied");
                Err(SluiceError::not_authorized("not allowed to modify data"))
            }
        }
    }

    /// Require the admin role.
    pub fn require_admin(&self, actor: Uuid, project_id: Uuid) -> SluiceResult<Role> {
        match self.role(actor, project_id)? {
            Some(Role::Admin) => Ok(Role::Admin),
            _ => Err(SluiceError::not_authorized("only project admins can manage connections")),
        }
    }
}
