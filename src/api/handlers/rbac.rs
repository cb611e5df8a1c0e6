//! Authorization queries for the authenticated caller.

use super::{error_response, require_subject, ErrorBody};
use crate::api::AppState;
use crate::rbac::{Permission, PermissionNode, Role};
use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

/// Permission needed to browse the permission tree.
pub const TREE_PERMISSION: &str = "permission:read";

#[derive(Deserialize, IntoParams)]
pub struct CheckQuery {
    /// Permission code, `resource:action`.
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PermissionCheck {
    pub code: String,
    pub granted: bool,
}

#[utoipa::path(
    get,
    path = "/v1/me/roles",
    responses(
        (status = 200, description = "Effective roles of the caller", body = [Role]),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "rbac"
)]
pub async fn my_roles(state: Extension<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let subject = match require_subject(&headers, &state).await {
        Ok(subject) => subject,
        Err(response) => return response,
    };
    let roles = state.resolver.roles_for(&subject, true).await;
    (StatusCode::OK, Json(roles)).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/me/permissions",
    responses(
        (status = 200, description = "Effective permissions of the caller", body = [Permission]),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "rbac"
)]
pub async fn my_permissions(state: Extension<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let subject = match require_subject(&headers, &state).await {
        Ok(subject) => subject,
        Err(response) => return response,
    };
    let permissions = state.resolver.permissions_for(&subject, true).await;
    (StatusCode::OK, Json(permissions)).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/me/permissions/check",
    params(CheckQuery),
    responses(
        (status = 200, description = "Whether the caller holds the permission", body = PermissionCheck),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "rbac"
)]
pub async fn check_permission(
    state: Extension<AppState>,
    headers: HeaderMap,
    Query(query): Query<CheckQuery>,
) -> impl IntoResponse {
    let subject = match require_subject(&headers, &state).await {
        Ok(subject) => subject,
        Err(response) => return response,
    };
    let granted = state.resolver.has_permission(&subject, &query.code).await;
    (
        StatusCode::OK,
        Json(PermissionCheck {
            code: query.code,
            granted,
        }),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/v1/permissions/tree",
    responses(
        (status = 200, description = "Permission forest ordered by sort order", body = [PermissionNode]),
        (status = 401, description = "Missing or invalid access token", body = ErrorBody),
        (status = 403, description = "Caller lacks permission:read", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "rbac"
)]
pub async fn permission_tree(state: Extension<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let subject = match require_subject(&headers, &state).await {
        Ok(subject) => subject,
        Err(response) => return response,
    };
    if !state.resolver.has_permission(&subject, TREE_PERMISSION).await {
        return error_response(
            StatusCode::FORBIDDEN,
            "forbidden",
            "Missing permission permission:read",
        );
    }

    match state.admin.permission_tree().await {
        Ok(tree) => (StatusCode::OK, Json(tree)).into_response(),
        Err(err) => {
            error!("Failed to build permission tree: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            )
        }
    }
}
