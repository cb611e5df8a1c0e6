//! Default permission and role catalog.
//!
//! Seeding is idempotent: existing entries are left as they are and only
//! missing permissions, roles and grants are added.

use super::models::{NewPermission, NewRole};
use super::repo::RbacRepository;
use super::RbacError;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

struct Group {
    resource: &'static str,
    name: &'static str,
    sort_order: i32,
    actions: &'static [(&'static str, &'static str)],
}

const CRUD: &[(&str, &str)] = &[
    ("create", "Create"),
    ("read", "Read"),
    ("update", "Update"),
    ("delete", "Delete"),
];

const USER_ACTIONS: &[(&str, &str)] = &[
    ("create", "Create"),
    ("read", "Read"),
    ("update", "Update"),
    ("delete", "Delete"),
    ("import", "Import"),
    ("export", "Export"),
];

const GROUPS: &[Group] = &[
    Group {
        resource: "user",
        name: "User management",
        sort_order: 1,
        actions: USER_ACTIONS,
    },
    Group {
        resource: "role",
        name: "Role management",
        sort_order: 2,
        actions: CRUD,
    },
    Group {
        resource: "permission",
        name: "Permission management",
        sort_order: 3,
        actions: CRUD,
    },
    Group {
        resource: "department",
        name: "Department management",
        sort_order: 4,
        actions: CRUD,
    },
];

enum Grants {
    Everything,
    Codes(&'static [&'static str]),
}

struct RoleSpec {
    code: &'static str,
    name: &'static str,
    description: &'static str,
    grants: Grants,
}

const ROLES: &[RoleSpec] = &[
    RoleSpec {
        code: "super_admin",
        name: "Super administrator",
        description: "Every permission in the catalog",
        grants: Grants::Everything,
    },
    RoleSpec {
        code: "admin",
        name: "Administrator",
        description: "Most management permissions",
        grants: Grants::Codes(&[
            "user:create",
            "user:read",
            "user:update",
            "user:delete",
            "user:import",
            "user:export",
            "role:create",
            "role:read",
            "role:update",
            "role:delete",
            "permission:create",
            "permission:read",
            "permission:update",
            "permission:delete",
            "department:create",
            "department:read",
            "department:update",
            "department:delete",
        ]),
    },
    RoleSpec {
        code: "user",
        name: "User",
        description: "Basic read access",
        grants: Grants::Codes(&["user:read", "department:read"]),
    },
    RoleSpec {
        code: "guest",
        name: "Guest",
        description: "Read-only visitor",
        grants: Grants::Codes(&["user:read"]),
    },
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub permissions_created: u32,
    pub roles_created: u32,
    pub grants_added: u64,
}

/// Install the default catalog into `repo`.
///
/// # Errors
/// Returns an error if the repository fails.
#[instrument(skip(repo))]
pub async fn seed_defaults(
    repo: &dyn RbacRepository,
    now: DateTime<Utc>,
) -> Result<SeedReport, RbacError> {
    let mut report = SeedReport::default();

    for group in GROUPS {
        let code = format!("{}:manage", group.resource);
        let parent = match repo.permission_by_code(&code).await? {
            Some(existing) => existing,
            None => {
                report.permissions_created += 1;
                let mut new = NewPermission::new(group.name, code)
                    .with_sort_order(group.sort_order)
                    .system();
                new.content_type = Some(group.resource.to_string());
                new.action = Some("manage".to_string());
                repo.insert_permission(new, now).await?
            }
        };

        for (order, (action, label)) in (1..).zip(group.actions.iter()) {
            let code = format!("{}:{action}", group.resource);
            if repo.permission_by_code(&code).await?.is_some() {
                continue;
            }
            let mut new = NewPermission::new(format!("{label} {}", group.resource), code)
                .with_parent(parent.id)
                .with_sort_order(order)
                .system();
            new.content_type = Some(group.resource.to_string());
            new.action = Some((*action).to_string());
            repo.insert_permission(new, now).await?;
            report.permissions_created += 1;
        }
    }

    let catalog = repo.permissions().await?;

    for (order, spec) in (1..).zip(ROLES.iter()) {
        let role = match repo.role_by_code(spec.code).await? {
            Some(existing) => existing,
            None => {
                report.roles_created += 1;
                let mut new = NewRole::new(spec.name, spec.code)
                    .with_description(spec.description)
                    .system();
                new.sort_order = order;
                repo.insert_role(new, now).await?
            }
        };

        let ids: Vec<i64> = match &spec.grants {
            Grants::Everything => catalog.iter().map(|p| p.id).collect(),
            Grants::Codes(codes) => {
                let wanted: BTreeSet<&str> = codes.iter().copied().collect();
                let ids: Vec<i64> = catalog
                    .iter()
                    .filter(|p| wanted.contains(p.code.as_str()))
                    .map(|p| p.id)
                    .collect();
                if ids.len() != wanted.len() {
                    warn!(role = spec.code, "some default permissions are missing");
                }
                ids
            }
        };
        if !ids.is_empty() {
            report.grants_added += repo.grant_permissions(role.id, &ids, None, now).await?;
        }
    }

    info!(
        permissions = report.permissions_created,
        roles = report.roles_created,
        grants = report.grants_added,
        "RBAC catalog seeded"
    );
    Ok(report)
}
