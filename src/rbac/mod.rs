//! Role-based access control.
//!
//! Users hold roles through [`UserRoleAssignment`]s, roles hold permissions
//! through [`RolePermission`]s and permissions form an acyclic tree.
//!
//! - [`RbacResolver`] answers "what may this user do", cached per user and
//!   failing closed when the relational store is unreachable.
//! - [`RbacAdmin`] applies write-side rules and invalidates resolver caches.
//! - [`seed::seed_defaults`] installs the default catalog.

pub mod admin;
pub mod models;
pub mod pg;
pub mod repo;
pub mod resolver;
pub mod seed;
pub mod tree;

pub use admin::RbacAdmin;
pub use models::{
    NewPermission, NewRole, Permission, PermissionUpdate, Role, RolePermission, RoleUpdate,
    Subject, UserRoleAssignment,
};
pub use pg::PgRbacRepository;
pub use repo::{MemoryRbacRepository, RbacRepository};
pub use resolver::RbacResolver;
pub use tree::PermissionNode;

#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is a system entry and cannot be deleted")]
    SystemProtected(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("Permission {permission} cannot be placed under its own descendant {parent}")]
    Cycle { permission: i64, parent: i64 },
    #[error("{0} already exists")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
