pub mod auth;
pub mod health;
pub mod rbac;

// common types and functions for the handlers
use super::AppState;
use crate::auth::TokenKind;
use crate::rbac::Subject;
use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            remaining_attempts: None,
            remaining_seconds: None,
        }
    }
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ErrorBody::new(code, message))).into_response()
}

/// Resolve the caller from an `Authorization: Bearer` access token.
///
/// The account is looked up on every request, so a disabled account or a
/// revoked superuser flag takes effect before the token expires.
pub(crate) async fn require_subject(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<Subject, Response> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    let Some(token) = token else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing bearer token",
        ));
    };

    let claims = match state.auth.tokens().verify(token, TokenKind::Access).await {
        Ok(claims) => claims,
        Err(err) => {
            debug!("Rejected access token: {err}");
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "Invalid or expired access token",
            ));
        }
    };

    let Ok(user_id) = claims.user_id() else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_token",
            "Invalid or expired access token",
        ));
    };

    match state.auth.identity().find(user_id).await {
        Ok(Some(principal)) if principal.is_active => Ok(Subject::from(&principal)),
        Ok(_) => {
            debug!(user_id, "Access token for a missing or disabled account");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "Invalid or expired access token",
            ))
        }
        Err(err) => {
            error!("Identity lookup failed: {err}");
            Err(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "Service temporarily unavailable",
            ))
        }
    }
}
