use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// A node of the permission tree. `code` is `resource:action`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Permission {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub content_type: Option<String>,
    pub action: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<i64>,
    pub sort_order: i32,
    pub is_active: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub sort_order: i32,
    pub is_active: bool,
    pub is_system: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Role {
    /// Active and not soft-deleted.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.is_active && !self.is_deleted
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RolePermission {
    pub role_id: i64,
    pub permission_id: i64,
    pub granted_by: Option<i64>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct UserRoleAssignment {
    pub user_id: i64,
    pub role_id: i64,
    pub is_active: bool,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub assigned_by: Option<i64>,
    pub assigned_at: DateTime<Utc>,
}

impl UserRoleAssignment {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// The assignment grants `role` at `now`.
    #[must_use]
    pub fn is_effective(&self, role: &Role, now: DateTime<Utc>) -> bool {
        self.role_id == role.id && self.is_active && !self.is_expired(now) && role.is_available()
    }
}

/// Who an authorization question is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subject {
    pub user_id: i64,
    pub is_superuser: bool,
}

impl Subject {
    #[must_use]
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_superuser: false,
        }
    }

    #[must_use]
    pub fn superuser(user_id: i64) -> Self {
        Self {
            user_id,
            is_superuser: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NewPermission {
    pub name: String,
    pub code: String,
    pub content_type: Option<String>,
    pub action: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<i64>,
    pub sort_order: i32,
    pub is_system: bool,
}

impl NewPermission {
    #[must_use]
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    #[must_use]
    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

/// Partial update; `None` leaves a field unchanged. `parent_id: Some(None)`
/// detaches the permission from its parent.
#[derive(Clone, Debug, Default)]
pub struct PermissionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Option<i64>>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct NewRole {
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub sort_order: i32,
    pub is_system: bool,
}

impl NewRole {
    #[must_use]
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub sort_order: Option<i32>,
    pub is_active: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn role(now: DateTime<Utc>) -> Role {
        Role {
            id: 1,
            name: "Admin".to_string(),
            code: "admin".to_string(),
            description: None,
            sort_order: 0,
            is_active: true,
            is_system: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn assignment(now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> UserRoleAssignment {
        UserRoleAssignment {
            user_id: 7,
            role_id: 1,
            is_active: true,
            expires_at,
            assigned_by: None,
            assigned_at: now,
        }
    }

    #[test]
    fn permanent_assignment_is_effective() {
        let now = Utc::now();
        assert!(assignment(now, None).is_effective(&role(now), now));
    }

    #[test]
    fn expired_assignment_is_not_effective() {
        let now = Utc::now();
        let grant = assignment(now, Some(now - TimeDelta::days(1)));
        assert!(grant.is_expired(now));
        assert!(!grant.is_effective(&role(now), now));

        // expiry is exclusive
        let grant = assignment(now, Some(now));
        assert!(!grant.is_effective(&role(now), now));
    }

    #[test]
    fn inactive_or_deleted_role_is_not_effective() {
        let now = Utc::now();
        let grant = assignment(now, None);

        let mut disabled = role(now);
        disabled.is_active = false;
        assert!(!grant.is_effective(&disabled, now));

        let mut deleted = role(now);
        deleted.is_deleted = true;
        assert!(!grant.is_effective(&deleted, now));

        let mut inactive = grant.clone();
        inactive.is_active = false;
        assert!(!inactive.is_effective(&role(now), now));
    }
}
