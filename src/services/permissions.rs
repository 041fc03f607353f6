//! Permission gate: decides whether an identity may act on a space.
//!
//! Levels are ordered `read < write < manage`. Admins bypass every space
//! check; everybody else needs an explicit grant at or above the required
//! level. Roles and grants come from the account directory.

use crate::{
    models::permission::{Grant, Identity, Permission, Role},
    services::error::{EngineError, EngineResult},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Source of roles and space grants (the account collaborator).
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn role_of(&self, username: &str) -> EngineResult<Option<Role>>;
    async fn grants_for(&self, username: &str) -> EngineResult<Vec<Grant>>;
}

/// The permission decision consumed by the engine and every adapter.
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn can_access_space(
        &self,
        username: &str,
        space_id: i64,
        level: Permission,
    ) -> EngineResult<bool>;
}

/// Pure decision over an already-loaded role and grant list.
pub fn decide(role: Role, grants: &[Grant], space_id: i64, required: Permission) -> bool {
    if role == Role::Admin {
        return true;
    }
    grants
        .iter()
        .any(|g| g.space_id == space_id && g.permission.satisfies(required))
}

#[derive(Clone)]
pub struct PermissionGate {
    directory: Arc<dyn AccountDirectory>,
}

impl PermissionGate {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    pub async fn can_access(
        &self,
        identity: &Identity,
        space_id: i64,
        required: Permission,
    ) -> EngineResult<bool> {
        if identity.is_admin() {
            return Ok(true);
        }
        let grants = self.directory.grants_for(&identity.username).await?;
        Ok(decide(identity.role, &grants, space_id, required))
    }

    /// Fail with `AccessDenied` unless the identity holds `required` on the space.
    pub async fn require(
        &self,
        identity: &Identity,
        space_id: i64,
        required: Permission,
    ) -> EngineResult<()> {
        if self.can_access(identity, space_id, required).await? {
            Ok(())
        } else {
            debug!(user = %identity, space_id, %required, "permission denied");
            Err(EngineError::denied(format!(
                "{} permission required on space {}",
                required, space_id
            )))
        }
    }
}

#[async_trait]
impl PermissionService for PermissionGate {
    async fn can_access_space(
        &self,
        username: &str,
        space_id: i64,
        level: Permission,
    ) -> EngineResult<bool> {
        let Some(role) = self.directory.role_of(username).await? else {
            return Ok(false);
        };
        self.can_access(&Identity::new(username, role), space_id, level)
            .await
    }
}
