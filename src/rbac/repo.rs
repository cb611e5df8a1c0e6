//! Persistence seam for RBAC entities.
//!
//! [`PgRbacRepository`](super::PgRbacRepository) backs production; the in-memory
//! implementation below serves tests and local runs without a database.

use super::models::{
    NewPermission, NewRole, Permission, Role, RolePermission, UserRoleAssignment,
};
use super::RbacError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

#[async_trait]
pub trait RbacRepository: Send + Sync {
    /// Ids of roles granted to the user by effective assignments at `now`.
    async fn effective_role_ids(&self, user_id: i64, now: DateTime<Utc>)
        -> Result<Vec<i64>, RbacError>;

    /// Roles among `ids` that are active and not soft-deleted.
    async fn available_roles(&self, ids: &[i64]) -> Result<Vec<Role>, RbacError>;

    async fn all_available_roles(&self) -> Result<Vec<Role>, RbacError>;

    /// Distinct permission ids granted to any of `role_ids`.
    async fn permission_ids_for_roles(&self, role_ids: &[i64]) -> Result<Vec<i64>, RbacError>;

    /// Active permissions among `ids`.
    async fn active_permissions(&self, ids: &[i64]) -> Result<Vec<Permission>, RbacError>;

    async fn all_active_permissions(&self) -> Result<Vec<Permission>, RbacError>;

    async fn permission(&self, id: i64) -> Result<Option<Permission>, RbacError>;

    async fn permission_by_code(&self, code: &str) -> Result<Option<Permission>, RbacError>;

    /// Every permission, ordered by (`sort_order`, `id`).
    async fn permissions(&self) -> Result<Vec<Permission>, RbacError>;

    async fn insert_permission(
        &self,
        new: NewPermission,
        now: DateTime<Utc>,
    ) -> Result<Permission, RbacError>;

    async fn save_permission(&self, permission: &Permission) -> Result<(), RbacError>;

    async fn role(&self, id: i64) -> Result<Option<Role>, RbacError>;

    async fn role_by_code(&self, code: &str) -> Result<Option<Role>, RbacError>;

    async fn insert_role(&self, new: NewRole, now: DateTime<Utc>) -> Result<Role, RbacError>;

    async fn save_role(&self, role: &Role) -> Result<(), RbacError>;

    async fn role_permission_ids(&self, role_id: i64) -> Result<Vec<i64>, RbacError>;

    async fn role_ids_with_permission(&self, permission_id: i64) -> Result<Vec<i64>, RbacError>;

    /// Grant the permissions the role does not hold yet. Returns how many were added.
    async fn grant_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        granted_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<u64, RbacError>;

    async fn revoke_permissions(&self, role_id: i64, permission_ids: &[i64])
        -> Result<u64, RbacError>;

    async fn clear_role_permissions(&self, role_id: i64) -> Result<u64, RbacError>;

    /// Insert or replace the (user, role) assignment.
    async fn upsert_user_role(&self, assignment: &UserRoleAssignment) -> Result<(), RbacError>;

    async fn remove_user_role(&self, user_id: i64, role_id: i64) -> Result<bool, RbacError>;

    async fn user_roles(&self, user_id: i64) -> Result<Vec<UserRoleAssignment>, RbacError>;

    /// Users holding the role through any assignment, effective or not.
    async fn users_with_role(&self, role_id: i64) -> Result<Vec<i64>, RbacError>;
}

#[derive(Debug, Default)]
struct Tables {
    next_permission_id: i64,
    next_role_id: i64,
    permissions: BTreeMap<i64, Permission>,
    roles: BTreeMap<i64, Role>,
    role_permissions: BTreeMap<(i64, i64), RolePermission>,
    user_roles: BTreeMap<(i64, i64), UserRoleAssignment>,
}

#[derive(Debug, Default)]
pub struct MemoryRbacRepository {
    tables: RwLock<Tables>,
}

impl MemoryRbacRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_permissions<'a>(iter: impl Iterator<Item = &'a Permission>) -> Vec<Permission> {
    let mut list: Vec<Permission> = iter.cloned().collect();
    list.sort_by_key(|p| (p.sort_order, p.id));
    list
}

fn sorted_roles<'a>(iter: impl Iterator<Item = &'a Role>) -> Vec<Role> {
    let mut list: Vec<Role> = iter.cloned().collect();
    list.sort_by_key(|r| (r.sort_order, r.id));
    list
}

#[async_trait]
impl RbacRepository for MemoryRbacRepository {
    async fn effective_role_ids(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables
            .user_roles
            .values()
            .filter(|a| a.user_id == user_id)
            .filter(|a| {
                tables
                    .roles
                    .get(&a.role_id)
                    .is_some_and(|role| a.is_effective(role, now))
            })
            .map(|a| a.role_id)
            .collect())
    }

    async fn available_roles(&self, ids: &[i64]) -> Result<Vec<Role>, RbacError> {
        let tables = self.tables.read().await;
        let wanted: BTreeSet<i64> = ids.iter().copied().collect();
        Ok(sorted_roles(
            tables
                .roles
                .values()
                .filter(|r| wanted.contains(&r.id) && r.is_available()),
        ))
    }

    async fn all_available_roles(&self) -> Result<Vec<Role>, RbacError> {
        let tables = self.tables.read().await;
        Ok(sorted_roles(tables.roles.values().filter(|r| r.is_available())))
    }

    async fn permission_ids_for_roles(&self, role_ids: &[i64]) -> Result<Vec<i64>, RbacError> {
        let tables = self.tables.read().await;
        let roles: BTreeSet<i64> = role_ids.iter().copied().collect();
        let ids: BTreeSet<i64> = tables
            .role_permissions
            .keys()
            .filter(|(role_id, _)| roles.contains(role_id))
            .map(|(_, permission_id)| *permission_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn active_permissions(&self, ids: &[i64]) -> Result<Vec<Permission>, RbacError> {
        let tables = self.tables.read().await;
        let wanted: BTreeSet<i64> = ids.iter().copied().collect();
        Ok(sorted_permissions(
            tables
                .permissions
                .values()
                .filter(|p| wanted.contains(&p.id) && p.is_active),
        ))
    }

    async fn all_active_permissions(&self) -> Result<Vec<Permission>, RbacError> {
        let tables = self.tables.read().await;
        Ok(sorted_permissions(
            tables.permissions.values().filter(|p| p.is_active),
        ))
    }

    async fn permission(&self, id: i64) -> Result<Option<Permission>, RbacError> {
        Ok(self.tables.read().await.permissions.get(&id).cloned())
    }

    async fn permission_by_code(&self, code: &str) -> Result<Option<Permission>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables.permissions.values().find(|p| p.code == code).cloned())
    }

    async fn permissions(&self) -> Result<Vec<Permission>, RbacError> {
        let tables = self.tables.read().await;
        Ok(sorted_permissions(tables.permissions.values()))
    }

    async fn insert_permission(
        &self,
        new: NewPermission,
        now: DateTime<Utc>,
    ) -> Result<Permission, RbacError> {
        let mut tables = self.tables.write().await;
        if tables.permissions.values().any(|p| p.code == new.code) {
            return Err(RbacError::Conflict(format!("Permission {}", new.code)));
        }
        tables.next_permission_id += 1;
        let permission = Permission {
            id: tables.next_permission_id,
            name: new.name,
            code: new.code,
            content_type: new.content_type,
            action: new.action,
            description: new.description,
            parent_id: new.parent_id,
            sort_order: new.sort_order,
            is_active: true,
            is_system: new.is_system,
            created_at: now,
            updated_at: now,
        };
        tables.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn save_permission(&self, permission: &Permission) -> Result<(), RbacError> {
        let mut tables = self.tables.write().await;
        match tables.permissions.get_mut(&permission.id) {
            Some(slot) => {
                *slot = permission.clone();
                Ok(())
            }
            None => Err(RbacError::NotFound(format!("Permission {}", permission.id))),
        }
    }

    async fn role(&self, id: i64) -> Result<Option<Role>, RbacError> {
        Ok(self.tables.read().await.roles.get(&id).cloned())
    }

    async fn role_by_code(&self, code: &str) -> Result<Option<Role>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables.roles.values().find(|r| r.code == code).cloned())
    }

    async fn insert_role(&self, new: NewRole, now: DateTime<Utc>) -> Result<Role, RbacError> {
        let mut tables = self.tables.write().await;
        if tables
            .roles
            .values()
            .any(|r| r.code == new.code || r.name == new.name)
        {
            return Err(RbacError::Conflict(format!("Role {}", new.code)));
        }
        tables.next_role_id += 1;
        let role = Role {
            id: tables.next_role_id,
            name: new.name,
            code: new.code,
            description: new.description,
            sort_order: new.sort_order,
            is_active: true,
            is_system: new.is_system,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn save_role(&self, role: &Role) -> Result<(), RbacError> {
        let mut tables = self.tables.write().await;
        match tables.roles.get_mut(&role.id) {
            Some(slot) => {
                *slot = role.clone();
                Ok(())
            }
            None => Err(RbacError::NotFound(format!("Role {}", role.id))),
        }
    }

    async fn role_permission_ids(&self, role_id: i64) -> Result<Vec<i64>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables
            .role_permissions
            .keys()
            .filter(|(r, _)| *r == role_id)
            .map(|(_, p)| *p)
            .collect())
    }

    async fn role_ids_with_permission(&self, permission_id: i64) -> Result<Vec<i64>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables
            .role_permissions
            .keys()
            .filter(|(_, p)| *p == permission_id)
            .map(|(r, _)| *r)
            .collect())
    }

    async fn grant_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        granted_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<u64, RbacError> {
        let mut tables = self.tables.write().await;
        let mut added = 0;
        for &permission_id in permission_ids {
            if tables.role_permissions.contains_key(&(role_id, permission_id)) {
                continue;
            }
            tables.role_permissions.insert(
                (role_id, permission_id),
                RolePermission {
                    role_id,
                    permission_id,
                    granted_by,
                    granted_at: now,
                },
            );
            added += 1;
        }
        Ok(added)
    }

    async fn revoke_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<u64, RbacError> {
        let mut tables = self.tables.write().await;
        let mut removed = 0;
        for &permission_id in permission_ids {
            if tables
                .role_permissions
                .remove(&(role_id, permission_id))
                .is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear_role_permissions(&self, role_id: i64) -> Result<u64, RbacError> {
        let mut tables = self.tables.write().await;
        let before = tables.role_permissions.len();
        tables.role_permissions.retain(|(r, _), _| *r != role_id);
        Ok(u64::try_from(before - tables.role_permissions.len()).unwrap_or(u64::MAX))
    }

    async fn upsert_user_role(&self, assignment: &UserRoleAssignment) -> Result<(), RbacError> {
        let mut tables = self.tables.write().await;
        tables
            .user_roles
            .insert((assignment.user_id, assignment.role_id), assignment.clone());
        Ok(())
    }

    async fn remove_user_role(&self, user_id: i64, role_id: i64) -> Result<bool, RbacError> {
        let mut tables = self.tables.write().await;
        Ok(tables.user_roles.remove(&(user_id, role_id)).is_some())
    }

    async fn user_roles(&self, user_id: i64) -> Result<Vec<UserRoleAssignment>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables
            .user_roles
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn users_with_role(&self, role_id: i64) -> Result<Vec<i64>, RbacError> {
        let tables = self.tables.read().await;
        Ok(tables
            .user_roles
            .values()
            .filter(|a| a.role_id == role_id)
            .map(|a| a.user_id)
            .collect())
    }
}
