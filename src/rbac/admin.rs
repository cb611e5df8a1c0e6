//! Write-side RBAC rules.
//!
//! Every mutation that can change what a user may do invalidates the resolver
//! cache of each affected user before returning.

use super::models::{
    NewPermission, NewRole, Permission, PermissionUpdate, Role, RoleUpdate, Subject,
    UserRoleAssignment,
};
use super::repo::RbacRepository;
use super::resolver::RbacResolver;
use super::tree::{self, PermissionNode};
use super::RbacError;
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};

/// `resource:action`, lowercase.
#[must_use]
pub fn valid_permission_code(code: &str) -> bool {
    code.len() <= 100
        && Regex::new(r"^[a-z][a-z0-9_]*:[a-z][a-z0-9_]*$").map_or(false, |re| re.is_match(code))
}

pub struct RbacAdmin {
    repo: Arc<dyn RbacRepository>,
    resolver: Arc<RbacResolver>,
    clock: Arc<dyn Clock>,
}

impl RbacAdmin {
    #[must_use]
    pub fn new(
        repo: Arc<dyn RbacRepository>,
        resolver: Arc<RbacResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            resolver,
            clock,
        }
    }

    async fn invalidate_users(&self, users: impl IntoIterator<Item = i64>) {
        let users: BTreeSet<i64> = users.into_iter().collect();
        for user_id in users {
            self.resolver.invalidate(user_id).await;
        }
    }

    async fn invalidate_role(&self, role_id: i64) -> Result<(), RbacError> {
        let users = self.repo.users_with_role(role_id).await?;
        self.invalidate_users(users).await;
        Ok(())
    }

    async fn invalidate_permission(&self, permission_id: i64) -> Result<(), RbacError> {
        let mut users = Vec::new();
        for role_id in self.repo.role_ids_with_permission(permission_id).await? {
            users.extend(self.repo.users_with_role(role_id).await?);
        }
        self.invalidate_users(users).await;
        Ok(())
    }

    async fn require_permission(&self, id: i64) -> Result<Permission, RbacError> {
        self.repo
            .permission(id)
            .await?
            .ok_or_else(|| RbacError::NotFound(format!("Permission {id}")))
    }

    async fn require_role(&self, id: i64) -> Result<Role, RbacError> {
        match self.repo.role(id).await? {
            Some(role) if !role.is_deleted => Ok(role),
            _ => Err(RbacError::NotFound(format!("Role {id}"))),
        }
    }

    async fn require_active_parent(&self, parent_id: i64) -> Result<(), RbacError> {
        let parent = self.require_permission(parent_id).await?;
        if !parent.is_active {
            return Err(RbacError::Validation(format!(
                "Parent permission {} must be active",
                parent.code
            )));
        }
        Ok(())
    }

    fn guard_system_role(actor: &Subject, role: &Role) -> Result<(), RbacError> {
        if role.is_system && !actor.is_superuser {
            return Err(RbacError::Forbidden(format!(
                "System role {} can only be changed by a superuser",
                role.code
            )));
        }
        Ok(())
    }

    /// Refuse to deactivate a system permission, one with active children or
    /// one still granted to a role.
    async fn guard_deactivation(&self, permission: &Permission) -> Result<(), RbacError> {
        if permission.is_system {
            return Err(RbacError::SystemProtected(format!(
                "Permission {}",
                permission.code
            )));
        }
        let has_active_children = self
            .repo
            .permissions()
            .await?
            .iter()
            .any(|p| p.parent_id == Some(permission.id) && p.is_active);
        if has_active_children {
            return Err(RbacError::Validation(format!(
                "Permission {} still has active children",
                permission.code
            )));
        }
        if !self
            .repo
            .role_ids_with_permission(permission.id)
            .await?
            .is_empty()
        {
            return Err(RbacError::Validation(format!(
                "Permission {} is granted to a role",
                permission.code
            )));
        }
        Ok(())
    }

    /// # Errors
    /// Fails on a malformed or duplicate code, or a missing or inactive parent.
    #[instrument(skip(self, new), fields(code = %new.code))]
    pub async fn create_permission(&self, mut new: NewPermission) -> Result<Permission, RbacError> {
        if new.name.trim().is_empty() {
            return Err(RbacError::Validation("Permission name is required".to_string()));
        }
        if !valid_permission_code(&new.code) {
            return Err(RbacError::Validation(format!(
                "Permission code {} must look like resource:action",
                new.code
            )));
        }
        if self.repo.permission_by_code(&new.code).await?.is_some() {
            return Err(RbacError::Conflict(format!("Permission {}", new.code)));
        }
        if let Some(parent_id) = new.parent_id {
            self.require_active_parent(parent_id).await?;
        }
        if let Some((resource, action)) = new.code.split_once(':') {
            if new.content_type.is_none() {
                new.content_type = Some(resource.to_string());
            }
            if new.action.is_none() {
                new.action = Some(action.to_string());
            }
        }

        let permission = self.repo.insert_permission(new, self.clock.now()).await?;
        info!(id = permission.id, "permission created");
        Ok(permission)
    }

    /// # Errors
    /// Fails when the permission is missing, is a system permission and the
    /// actor is not a superuser, or the new parent is invalid or a descendant.
    /// Deactivation is refused in the same cases as [`Self::delete_permission`].
    #[instrument(skip(self, update))]
    pub async fn update_permission(
        &self,
        actor: &Subject,
        id: i64,
        update: PermissionUpdate,
    ) -> Result<Permission, RbacError> {
        let mut permission = self.require_permission(id).await?;
        if permission.is_system && !actor.is_superuser {
            return Err(RbacError::Forbidden(format!(
                "System permission {} can only be changed by a superuser",
                permission.code
            )));
        }
        if permission.is_active && update.is_active == Some(false) {
            self.guard_deactivation(&permission).await?;
        }

        if let Some(parent) = update.parent_id {
            if let Some(parent_id) = parent {
                if parent_id == id {
                    return Err(RbacError::Cycle {
                        permission: id,
                        parent: parent_id,
                    });
                }
                self.require_active_parent(parent_id).await?;
                let parents: HashMap<i64, Option<i64>> = self
                    .repo
                    .permissions()
                    .await?
                    .into_iter()
                    .map(|p| (p.id, p.parent_id))
                    .collect();
                if tree::creates_cycle(&parents, id, parent_id) {
                    return Err(RbacError::Cycle {
                        permission: id,
                        parent: parent_id,
                    });
                }
            }
            permission.parent_id = parent;
        }
        if let Some(name) = update.name {
            permission.name = name;
        }
        if let Some(description) = update.description {
            permission.description = Some(description);
        }
        if let Some(sort_order) = update.sort_order {
            permission.sort_order = sort_order;
        }
        let activity_changed = update
            .is_active
            .is_some_and(|active| active != permission.is_active);
        if let Some(active) = update.is_active {
            permission.is_active = active;
        }
        permission.updated_at = self.clock.now();

        self.repo.save_permission(&permission).await?;
        if activity_changed {
            self.invalidate_permission(id).await?;
        }
        Ok(permission)
    }

    /// Soft-delete (deactivate) a permission.
    ///
    /// # Errors
    /// Refused for system permissions, permissions with active children and
    /// permissions still granted to a role.
    #[instrument(skip(self))]
    pub async fn delete_permission(&self, id: i64) -> Result<(), RbacError> {
        let mut permission = self.require_permission(id).await?;
        self.guard_deactivation(&permission).await?;

        permission.is_active = false;
        permission.updated_at = self.clock.now();
        self.repo.save_permission(&permission).await?;
        info!(code = %permission.code, "permission deactivated");
        Ok(())
    }

    /// # Errors
    /// Fails on an empty name, a malformed code or a duplicate.
    #[instrument(skip(self, new), fields(code = %new.code))]
    pub async fn create_role(&self, new: NewRole) -> Result<Role, RbacError> {
        if new.name.trim().is_empty() || new.code.trim().is_empty() {
            return Err(RbacError::Validation(
                "Role name and code are required".to_string(),
            ));
        }
        if self.repo.role_by_code(&new.code).await?.is_some() {
            return Err(RbacError::Conflict(format!("Role {}", new.code)));
        }
        let role = self.repo.insert_role(new, self.clock.now()).await?;
        info!(id = role.id, "role created");
        Ok(role)
    }

    /// # Errors
    /// Fails when the role is missing or is a system role and the actor is not
    /// a superuser.
    #[instrument(skip(self, update))]
    pub async fn update_role(
        &self,
        actor: &Subject,
        id: i64,
        update: RoleUpdate,
    ) -> Result<Role, RbacError> {
        let mut role = self.require_role(id).await?;
        Self::guard_system_role(actor, &role)?;

        if let Some(name) = update.name {
            role.name = name;
        }
        if let Some(description) = update.description {
            role.description = Some(description);
        }
        if let Some(sort_order) = update.sort_order {
            role.sort_order = sort_order;
        }
        let activity_changed = update.is_active.is_some_and(|active| active != role.is_active);
        if let Some(active) = update.is_active {
            role.is_active = active;
        }
        role.updated_at = self.clock.now();

        self.repo.save_role(&role).await?;
        if activity_changed {
            self.invalidate_role(id).await?;
        }
        Ok(role)
    }

    /// Soft-delete a role.
    ///
    /// # Errors
    /// Refused for system roles.
    #[instrument(skip(self))]
    pub async fn delete_role(&self, id: i64) -> Result<(), RbacError> {
        let mut role = self.require_role(id).await?;
        if role.is_system {
            return Err(RbacError::SystemProtected(format!("Role {}", role.code)));
        }
        let now = self.clock.now();
        role.is_deleted = true;
        role.deleted_at = Some(now);
        role.updated_at = now;
        self.repo.save_role(&role).await?;
        self.invalidate_role(id).await?;
        info!(code = %role.code, "role deleted");
        Ok(())
    }

    async fn checked_permission_ids(&self, ids: &[i64]) -> Result<Vec<i64>, RbacError> {
        if ids.is_empty() {
            return Err(RbacError::Validation(
                "At least one permission id is required".to_string(),
            ));
        }
        let unique: BTreeSet<i64> = ids.iter().copied().collect();
        for &id in &unique {
            self.require_permission(id).await?;
        }
        Ok(unique.into_iter().collect())
    }

    /// Grant permissions to a role. Returns how many were newly granted.
    ///
    /// # Errors
    /// Fails for unknown ids, an empty list, or a system role changed by a
    /// non-superuser.
    #[instrument(skip(self))]
    pub async fn add_role_permissions(
        &self,
        actor: &Subject,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<u64, RbacError> {
        let role = self.require_role(role_id).await?;
        Self::guard_system_role(actor, &role)?;
        let ids = self.checked_permission_ids(permission_ids).await?;
        let added = self
            .repo
            .grant_permissions(role_id, &ids, Some(actor.user_id), self.clock.now())
            .await?;
        self.invalidate_role(role_id).await?;
        Ok(added)
    }

    /// # Errors
    /// Fails for an empty list or a system role changed by a non-superuser.
    #[instrument(skip(self))]
    pub async fn remove_role_permissions(
        &self,
        actor: &Subject,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<u64, RbacError> {
        let role = self.require_role(role_id).await?;
        Self::guard_system_role(actor, &role)?;
        if permission_ids.is_empty() {
            return Err(RbacError::Validation(
                "At least one permission id is required".to_string(),
            ));
        }
        let removed = self.repo.revoke_permissions(role_id, permission_ids).await?;
        self.invalidate_role(role_id).await?;
        Ok(removed)
    }

    /// Replace the full permission set of a role. An empty list clears it.
    ///
    /// # Errors
    /// Fails for unknown ids or a system role changed by a non-superuser.
    #[instrument(skip(self))]
    pub async fn replace_role_permissions(
        &self,
        actor: &Subject,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<u64, RbacError> {
        let role = self.require_role(role_id).await?;
        Self::guard_system_role(actor, &role)?;
        let ids = if permission_ids.is_empty() {
            Vec::new()
        } else {
            self.checked_permission_ids(permission_ids).await?
        };
        self.repo.clear_role_permissions(role_id).await?;
        let granted = if ids.is_empty() {
            0
        } else {
            self.repo
                .grant_permissions(role_id, &ids, Some(actor.user_id), self.clock.now())
                .await?
        };
        self.invalidate_role(role_id).await?;
        Ok(granted)
    }

    /// Permissions currently granted to a role.
    ///
    /// # Errors
    /// Fails when the role is missing or the store errors.
    pub async fn role_permissions(&self, role_id: i64) -> Result<Vec<Permission>, RbacError> {
        self.require_role(role_id).await?;
        let ids = self.repo.role_permission_ids(role_id).await?;
        let wanted: BTreeSet<i64> = ids.into_iter().collect();
        Ok(self
            .repo
            .permissions()
            .await?
            .into_iter()
            .filter(|p| wanted.contains(&p.id))
            .collect())
    }

    /// Grant a role to a user, optionally until `expires_at`.
    ///
    /// # Errors
    /// Fails when the role is unavailable or the expiry is not in the future.
    #[instrument(skip(self))]
    pub async fn assign_role(
        &self,
        actor: &Subject,
        user_id: i64,
        role_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRoleAssignment, RbacError> {
        let role = self.require_role(role_id).await?;
        if !role.is_available() {
            return Err(RbacError::Validation(format!(
                "Role {} is not active",
                role.code
            )));
        }
        let now = self.clock.now();
        if expires_at.is_some_and(|at| at <= now) {
            return Err(RbacError::Validation(
                "Expiry must be in the future".to_string(),
            ));
        }
        let assignment = UserRoleAssignment {
            user_id,
            role_id,
            is_active: true,
            expires_at,
            assigned_by: Some(actor.user_id),
            assigned_at: now,
        };
        self.repo.upsert_user_role(&assignment).await?;
        self.resolver.invalidate(user_id).await;
        info!(code = %role.code, "role assigned");
        Ok(assignment)
    }

    /// # Errors
    /// Fails when the store errors.
    #[instrument(skip(self))]
    pub async fn revoke_role(&self, user_id: i64, role_id: i64) -> Result<bool, RbacError> {
        let removed = self.repo.remove_user_role(user_id, role_id).await?;
        self.resolver.invalidate(user_id).await;
        Ok(removed)
    }

    /// # Errors
    /// Fails when the store errors.
    pub async fn user_roles(&self, user_id: i64) -> Result<Vec<UserRoleAssignment>, RbacError> {
        self.repo.user_roles(user_id).await
    }

    /// The whole permission tree.
    ///
    /// # Errors
    /// Fails when the store errors.
    pub async fn permission_tree(&self) -> Result<Vec<PermissionNode>, RbacError> {
        Ok(tree::build(&self.repo.permissions().await?))
    }
}
