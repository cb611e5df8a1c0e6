//! Effective role and permission resolution.
//!
//! Flow Overview:
//! 1) Superusers short-circuit to "everything" without touching the cache.
//! 2) Role ids are cached per user under `user_roles:<id>`, permission ids under
//!    `user_permissions:<id>`, both for five minutes.
//! 3) Cache hits are re-filtered against current role and permission state, so a
//!    role disabled after caching disappears immediately. A role granted after
//!    caching shows up once the entry expires or is invalidated.
//!
//! Relational errors resolve to empty sets (fail closed). Cache errors only
//! bypass the cache.

use super::models::{Permission, Role, Subject};
use super::repo::RbacRepository;
use crate::clock::Clock;
use crate::store::EphemeralStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub struct RbacResolver {
    repo: Arc<dyn RbacRepository>,
    cache: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl RbacResolver {
    #[must_use]
    pub fn new(
        repo: Arc<dyn RbacRepository>,
        cache: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            ttl: CACHE_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn roles_key(user_id: i64) -> String {
        format!("user_roles:{user_id}")
    }

    fn permissions_key(user_id: i64) -> String {
        format!("user_permissions:{user_id}")
    }

    async fn cached_ids(&self, key: &str) -> Option<Vec<i64>> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(ids) => Some(ids),
                Err(err) => {
                    warn!("Discarding malformed RBAC cache entry: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("RBAC cache unavailable: {err}");
                None
            }
        }
    }

    async fn cache_ids(&self, key: &str, ids: &[i64]) {
        let raw = match serde_json::to_string(ids) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("Failed to encode RBAC cache entry: {err}");
                return;
            }
        };
        if let Err(err) = self.cache.set(key, &raw, Some(self.ttl)).await {
            warn!("RBAC cache unavailable: {err}");
        }
    }

    /// Effective roles of `subject`.
    #[instrument(skip(self))]
    pub async fn roles_for(&self, subject: &Subject, use_cache: bool) -> Vec<Role> {
        if subject.is_superuser {
            return self.repo.all_available_roles().await.unwrap_or_else(|err| {
                error!("Failed to load roles: {err}");
                Vec::new()
            });
        }

        let key = Self::roles_key(subject.user_id);
        if use_cache {
            if let Some(ids) = self.cached_ids(&key).await {
                debug!("role cache hit");
                return self.repo.available_roles(&ids).await.unwrap_or_else(|err| {
                    error!("Failed to load roles: {err}");
                    Vec::new()
                });
            }
        }

        let ids = match self
            .repo
            .effective_role_ids(subject.user_id, self.clock.now())
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                error!("Failed to resolve user roles: {err}");
                return Vec::new();
            }
        };

        if use_cache {
            self.cache_ids(&key, &ids).await;
        }

        self.repo.available_roles(&ids).await.unwrap_or_else(|err| {
            error!("Failed to load roles: {err}");
            Vec::new()
        })
    }

    /// Effective permissions of `subject`: the union of its roles' active grants.
    #[instrument(skip(self))]
    pub async fn permissions_for(&self, subject: &Subject, use_cache: bool) -> Vec<Permission> {
        if subject.is_superuser {
            return self
                .repo
                .all_active_permissions()
                .await
                .unwrap_or_else(|err| {
                    error!("Failed to load permissions: {err}");
                    Vec::new()
                });
        }

        let key = Self::permissions_key(subject.user_id);
        if use_cache {
            if let Some(ids) = self.cached_ids(&key).await {
                debug!("permission cache hit");
                return self.repo.active_permissions(&ids).await.unwrap_or_else(|err| {
                    error!("Failed to load permissions: {err}");
                    Vec::new()
                });
            }
        }

        let role_ids: Vec<i64> = self
            .roles_for(subject, false)
            .await
            .iter()
            .map(|role| role.id)
            .collect();

        let permissions = if role_ids.is_empty() {
            Vec::new()
        } else {
            let granted = match self.repo.permission_ids_for_roles(&role_ids).await {
                Ok(ids) => ids,
                Err(err) => {
                    error!("Failed to resolve role permissions: {err}");
                    return Vec::new();
                }
            };
            match self.repo.active_permissions(&granted).await {
                Ok(permissions) => permissions,
                Err(err) => {
                    error!("Failed to load permissions: {err}");
                    return Vec::new();
                }
            }
        };

        // empty sets are cached as well
        if use_cache {
            let ids: Vec<i64> = permissions.iter().map(|p| p.id).collect();
            self.cache_ids(&key, &ids).await;
        }

        permissions
    }

    pub async fn role_codes(&self, subject: &Subject) -> BTreeSet<String> {
        self.roles_for(subject, true)
            .await
            .into_iter()
            .map(|role| role.code)
            .collect()
    }

    pub async fn permission_codes(&self, subject: &Subject) -> BTreeSet<String> {
        self.permissions_for(subject, true)
            .await
            .into_iter()
            .map(|permission| permission.code)
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn has_role(&self, subject: &Subject, code: &str) -> bool {
        if subject.is_superuser {
            return true;
        }
        self.roles_for(subject, true)
            .await
            .iter()
            .any(|role| role.code == code)
    }

    #[instrument(skip(self))]
    pub async fn has_permission(&self, subject: &Subject, code: &str) -> bool {
        if subject.is_superuser {
            return true;
        }
        self.permissions_for(subject, true)
            .await
            .iter()
            .any(|permission| permission.code == code)
    }

    /// Drop both cached sets of `user_id`.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, user_id: i64) {
        for key in [Self::roles_key(user_id), Self::permissions_key(user_id)] {
            if let Err(err) = self.cache.delete(&key).await {
                warn!("Failed to invalidate RBAC cache: {err}");
            }
        }
    }
}
