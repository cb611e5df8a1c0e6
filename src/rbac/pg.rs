//! PostgreSQL-backed [`RbacRepository`]. Table layout lives in `sql/schema.sql`.

use super::models::{NewPermission, NewRole, Permission, Role, UserRoleAssignment};
use super::repo::RbacRepository;
use super::RbacError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info_span, Instrument, Span};

const PERMISSION_COLUMNS: &str = "id, name, code, content_type, action, description, parent_id, \
     sort_order, is_active, is_system, created_at, updated_at";

const ROLE_COLUMNS: &str = "id, name, code, description, sort_order, is_active, is_system, \
     is_deleted, created_at, updated_at, deleted_at";

fn span(operation: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation
    )
}

fn conflict_or(err: sqlx::Error, what: String) -> RbacError {
    let unique = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique {
        RbacError::Conflict(what)
    } else {
        RbacError::Database(err)
    }
}

#[derive(Clone, Debug)]
pub struct PgRbacRepository {
    pool: PgPool,
}

impl PgRbacRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn permissions_where(
        &self,
        clause: &str,
        ids: Option<&[i64]>,
    ) -> Result<Vec<Permission>, RbacError> {
        let query = format!(
            "SELECT {PERMISSION_COLUMNS} FROM sys_permission {clause} ORDER BY sort_order, id"
        );
        let mut q = sqlx::query_as::<_, Permission>(&query);
        if let Some(ids) = ids {
            q = q.bind(ids.to_vec());
        }
        Ok(q.fetch_all(&self.pool).instrument(span("SELECT")).await?)
    }

    async fn roles_where(&self, clause: &str, ids: Option<&[i64]>) -> Result<Vec<Role>, RbacError> {
        let query =
            format!("SELECT {ROLE_COLUMNS} FROM sys_role {clause} ORDER BY sort_order, id");
        let mut q = sqlx::query_as::<_, Role>(&query);
        if let Some(ids) = ids {
            q = q.bind(ids.to_vec());
        }
        Ok(q.fetch_all(&self.pool).instrument(span("SELECT")).await?)
    }
}

#[async_trait]
impl RbacRepository for PgRbacRepository {
    async fn effective_role_ids(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, RbacError> {
        let query = r"
            SELECT ur.role_id
            FROM sys_user_role ur
            JOIN sys_role r ON r.id = ur.role_id
            WHERE ur.user_id = $1
              AND ur.is_active
              AND (ur.expires_at IS NULL OR ur.expires_at > $2)
              AND r.is_active
              AND NOT r.is_deleted
        ";
        Ok(sqlx::query_scalar::<_, i64>(query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn available_roles(&self, ids: &[i64]) -> Result<Vec<Role>, RbacError> {
        self.roles_where(
            "WHERE id = ANY($1) AND is_active AND NOT is_deleted",
            Some(ids),
        )
        .await
    }

    async fn all_available_roles(&self) -> Result<Vec<Role>, RbacError> {
        self.roles_where("WHERE is_active AND NOT is_deleted", None)
            .await
    }

    async fn permission_ids_for_roles(&self, role_ids: &[i64]) -> Result<Vec<i64>, RbacError> {
        let query = "SELECT DISTINCT permission_id FROM sys_role_permission WHERE role_id = ANY($1) ORDER BY permission_id";
        Ok(sqlx::query_scalar::<_, i64>(query)
            .bind(role_ids.to_vec())
            .fetch_all(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn active_permissions(&self, ids: &[i64]) -> Result<Vec<Permission>, RbacError> {
        self.permissions_where("WHERE id = ANY($1) AND is_active", Some(ids))
            .await
    }

    async fn all_active_permissions(&self) -> Result<Vec<Permission>, RbacError> {
        self.permissions_where("WHERE is_active", None).await
    }

    async fn permission(&self, id: i64) -> Result<Option<Permission>, RbacError> {
        let query = format!("SELECT {PERMISSION_COLUMNS} FROM sys_permission WHERE id = $1");
        Ok(sqlx::query_as::<_, Permission>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn permission_by_code(&self, code: &str) -> Result<Option<Permission>, RbacError> {
        let query = format!("SELECT {PERMISSION_COLUMNS} FROM sys_permission WHERE code = $1");
        Ok(sqlx::query_as::<_, Permission>(&query)
            .bind(code)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn permissions(&self) -> Result<Vec<Permission>, RbacError> {
        self.permissions_where("", None).await
    }

    async fn insert_permission(
        &self,
        new: NewPermission,
        now: DateTime<Utc>,
    ) -> Result<Permission, RbacError> {
        let query = format!(
            r"
            INSERT INTO sys_permission
                (name, code, content_type, action, description, parent_id, sort_order,
                 is_active, is_system, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, $9)
            RETURNING {PERMISSION_COLUMNS}
            "
        );
        sqlx::query_as::<_, Permission>(&query)
            .bind(&new.name)
            .bind(&new.code)
            .bind(&new.content_type)
            .bind(&new.action)
            .bind(&new.description)
            .bind(new.parent_id)
            .bind(new.sort_order)
            .bind(new.is_system)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(span("INSERT"))
            .await
            .map_err(|err| conflict_or(err, format!("Permission {}", new.code)))
    }

    async fn save_permission(&self, permission: &Permission) -> Result<(), RbacError> {
        let query = r"
            UPDATE sys_permission
            SET name = $2, description = $3, parent_id = $4, sort_order = $5,
                is_active = $6, updated_at = $7
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(permission.id)
            .bind(&permission.name)
            .bind(&permission.description)
            .bind(permission.parent_id)
            .bind(permission.sort_order)
            .bind(permission.is_active)
            .bind(permission.updated_at)
            .execute(&self.pool)
            .instrument(span("UPDATE"))
            .await?;
        if result.rows_affected() == 0 {
            return Err(RbacError::NotFound(format!("Permission {}", permission.id)));
        }
        Ok(())
    }

    async fn role(&self, id: i64) -> Result<Option<Role>, RbacError> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM sys_role WHERE id = $1");
        Ok(sqlx::query_as::<_, Role>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn role_by_code(&self, code: &str) -> Result<Option<Role>, RbacError> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM sys_role WHERE code = $1");
        Ok(sqlx::query_as::<_, Role>(&query)
            .bind(code)
            .fetch_optional(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn insert_role(&self, new: NewRole, now: DateTime<Utc>) -> Result<Role, RbacError> {
        let query = format!(
            r"
            INSERT INTO sys_role
                (name, code, description, sort_order, is_active, is_system, is_deleted,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, FALSE, $6, $6)
            RETURNING {ROLE_COLUMNS}
            "
        );
        sqlx::query_as::<_, Role>(&query)
            .bind(&new.name)
            .bind(&new.code)
            .bind(&new.description)
            .bind(new.sort_order)
            .bind(new.is_system)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(span("INSERT"))
            .await
            .map_err(|err| conflict_or(err, format!("Role {}", new.code)))
    }

    async fn save_role(&self, role: &Role) -> Result<(), RbacError> {
        let query = r"
            UPDATE sys_role
            SET name = $2, description = $3, sort_order = $4, is_active = $5,
                is_deleted = $6, deleted_at = $7, updated_at = $8
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(role.id)
            .bind(&role.name)
            .bind(&role.description)
            .bind(role.sort_order)
            .bind(role.is_active)
            .bind(role.is_deleted)
            .bind(role.deleted_at)
            .bind(role.updated_at)
            .execute(&self.pool)
            .instrument(span("UPDATE"))
            .await
            .map_err(|err| conflict_or(err, format!("Role {}", role.code)))?;
        if result.rows_affected() == 0 {
            return Err(RbacError::NotFound(format!("Role {}", role.id)));
        }
        Ok(())
    }

    async fn role_permission_ids(&self, role_id: i64) -> Result<Vec<i64>, RbacError> {
        let query = "SELECT permission_id FROM sys_role_permission WHERE role_id = $1 ORDER BY permission_id";
        Ok(sqlx::query_scalar::<_, i64>(query)
            .bind(role_id)
            .fetch_all(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn role_ids_with_permission(&self, permission_id: i64) -> Result<Vec<i64>, RbacError> {
        let query = "SELECT role_id FROM sys_role_permission WHERE permission_id = $1 ORDER BY role_id";
        Ok(sqlx::query_scalar::<_, i64>(query)
            .bind(permission_id)
            .fetch_all(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn grant_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
        granted_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<u64, RbacError> {
        let query = r"
            INSERT INTO sys_role_permission (role_id, permission_id, granted_by, granted_at)
            SELECT $1, permission_id, $3, $4
            FROM UNNEST($2::BIGINT[]) AS t(permission_id)
            ON CONFLICT (role_id, permission_id) DO NOTHING
        ";
        let result = sqlx::query(query)
            .bind(role_id)
            .bind(permission_ids.to_vec())
            .bind(granted_by)
            .bind(now)
            .execute(&self.pool)
            .instrument(span("INSERT"))
            .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_permissions(
        &self,
        role_id: i64,
        permission_ids: &[i64],
    ) -> Result<u64, RbacError> {
        let query =
            "DELETE FROM sys_role_permission WHERE role_id = $1 AND permission_id = ANY($2)";
        let result = sqlx::query(query)
            .bind(role_id)
            .bind(permission_ids.to_vec())
            .execute(&self.pool)
            .instrument(span("DELETE"))
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_role_permissions(&self, role_id: i64) -> Result<u64, RbacError> {
        let result = sqlx::query("DELETE FROM sys_role_permission WHERE role_id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .instrument(span("DELETE"))
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_user_role(&self, assignment: &UserRoleAssignment) -> Result<(), RbacError> {
        let query = r"
            INSERT INTO sys_user_role
                (user_id, role_id, is_active, expires_at, assigned_by, assigned_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, role_id) DO UPDATE
            SET is_active = EXCLUDED.is_active,
                expires_at = EXCLUDED.expires_at,
                assigned_by = EXCLUDED.assigned_by,
                assigned_at = EXCLUDED.assigned_at
        ";
        sqlx::query(query)
            .bind(assignment.user_id)
            .bind(assignment.role_id)
            .bind(assignment.is_active)
            .bind(assignment.expires_at)
            .bind(assignment.assigned_by)
            .bind(assignment.assigned_at)
            .execute(&self.pool)
            .instrument(span("INSERT"))
            .await?;
        Ok(())
    }

    async fn remove_user_role(&self, user_id: i64, role_id: i64) -> Result<bool, RbacError> {
        let result = sqlx::query("DELETE FROM sys_user_role WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .instrument(span("DELETE"))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn user_roles(&self, user_id: i64) -> Result<Vec<UserRoleAssignment>, RbacError> {
        let query = r"
            SELECT user_id, role_id, is_active, expires_at, assigned_by, assigned_at
            FROM sys_user_role
            WHERE user_id = $1
            ORDER BY assigned_at DESC
        ";
        Ok(sqlx::query_as::<_, UserRoleAssignment>(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span("SELECT"))
            .await?)
    }

    async fn users_with_role(&self, role_id: i64) -> Result<Vec<i64>, RbacError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT user_id FROM sys_user_role WHERE role_id = $1")
                .bind(role_id)
                .fetch_all(&self.pool)
                .instrument(span("SELECT"))
                .await?,
        )
    }
}
