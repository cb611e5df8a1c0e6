//! Login, registration, challenge and token endpoints.
//!
//! Flow Overview:
//! 1) Build the [`ClientContext`] from forwarding headers or the socket peer.
//! 2) Hand the request to the [`crate::auth::Authenticator`].
//! 3) Map rejections to statuses; `locked` also sets `Retry-After`.

use super::{error_response, ErrorBody};
use crate::api::AppState;
use crate::auth::{
    AuthError, LoginOutcome, LoginRequest, LoginSuccess, RegisterRequest, Rejection, TokenError,
    TokenPair,
};
use crate::security::ClientContext;
use axum::{
    extract::{ConnectInfo, Extension},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::error;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeResponse {
    /// Identifier the solution is bound to (the client address).
    pub key: String,
    /// `data:` URI of the rendered challenge.
    pub image: String,
    pub expires_in: u64,
}

#[derive(ToSchema, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[must_use]
pub fn status_for(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::BadRequest { .. } => StatusCode::BAD_REQUEST,
        Rejection::IpBanned | Rejection::AccountDisabled => StatusCode::FORBIDDEN,
        Rejection::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
        Rejection::ChallengeRequired { .. }
        | Rejection::ChallengeFailed { .. }
        | Rejection::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
        Rejection::UsernameTaken => StatusCode::CONFLICT,
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    let body = ErrorBody {
        code: rejection.code().to_string(),
        message: rejection.message(),
        remaining_attempts: rejection.remaining_attempts(),
        remaining_seconds: rejection.remaining_seconds(),
    };
    let mut headers = HeaderMap::new();
    if let Some(seconds) = rejection.remaining_seconds() {
        headers.insert(RETRY_AFTER, HeaderValue::from(seconds));
    }
    (status_for(rejection), headers, Json(body)).into_response()
}

fn auth_error_response(err: &AuthError) -> Response {
    match err {
        AuthError::Token(TokenError::Unavailable(store)) => {
            error!("Token store unavailable: {store}");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "Service temporarily unavailable",
            )
        }
        AuthError::Token(err) => {
            error!("Token rejected: {err}");
            error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                "Invalid or expired token",
            )
        }
        AuthError::Identity(err) => {
            error!("Identity store failure: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error",
            )
        }
    }
}

fn client_context(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> ClientContext {
    ClientContext::from_headers(headers, connect.map(|ConnectInfo(addr)| addr))
}

fn outcome_response(outcome: LoginOutcome, success: StatusCode) -> Response {
    match outcome {
        LoginOutcome::Success(body) => (success, Json(*body)).into_response(),
        LoginOutcome::Rejected(rejection) => rejection_response(&rejection),
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/challenge",
    responses(
        (status = 200, description = "Challenge issued for the client address", body = ChallengeResponse),
        (status = 503, description = "Challenge store unavailable", body = ErrorBody),
    ),
    tag = "auth"
)]
pub async fn challenge(
    state: Extension<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ctx = client_context(&headers, connect);
    match state.auth.challenge(&ctx).await {
        Ok(challenge) => (
            StatusCode::OK,
            Json(ChallengeResponse {
                key: ctx.ip,
                image: challenge.image,
                expires_in: state.auth.challenges().ttl().as_secs(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to issue challenge: {err}");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "Challenge service temporarily unavailable",
            )
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginSuccess),
        (status = 400, description = "Missing username or password", body = ErrorBody),
        (status = 401, description = "Invalid credentials, or a challenge is required or wrong", body = ErrorBody),
        (status = 403, description = "Address banned or account disabled", body = ErrorBody),
        (status = 429, description = "Too many failed attempts", body = ErrorBody),
    ),
    tag = "auth"
)]
pub async fn login(
    state: Extension<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "Missing payload");
    };
    let ctx = client_context(&headers, connect);

    match state.auth.login(&request, &ctx).await {
        Ok(outcome) => outcome_response(outcome, StatusCode::OK),
        Err(err) => auth_error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and logged in", body = LoginSuccess),
        (status = 400, description = "Invalid username or password", body = ErrorBody),
        (status = 403, description = "Address banned", body = ErrorBody),
        (status = 409, description = "Username already taken", body = ErrorBody),
    ),
    tag = "auth"
)]
pub async fn register(
    state: Extension<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "Missing payload");
    };
    let ctx = client_context(&headers, connect);

    match state.auth.register(&request, &ctx).await {
        Ok(outcome) => outcome_response(outcome, StatusCode::CREATED),
        Err(err) => auth_error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair, the presented refresh token is revoked", body = TokenPair),
        (status = 401, description = "Invalid, expired or revoked refresh token", body = ErrorBody),
    ),
    tag = "auth"
)]
pub async fn refresh(
    state: Extension<AppState>,
    payload: Option<Json<RefreshRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "Missing payload");
    };

    match state.auth.refresh(&request.refresh_token).await {
        Ok(pair) => (StatusCode::OK, Json(pair)).into_response(),
        Err(err) => auth_error_response(&err),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = RefreshRequest,
    responses(
        (status = 204, description = "Refresh token revoked"),
        (status = 401, description = "Invalid, expired or revoked refresh token", body = ErrorBody),
    ),
    tag = "auth"
)]
pub async fn logout(
    state: Extension<AppState>,
    payload: Option<Json<RefreshRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "Missing payload");
    };

    match state.auth.logout(&request.refresh_token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => auth_error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_rejection_kind() {
        assert_eq!(
            status_for(&Rejection::BadRequest {
                message: String::new()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&Rejection::IpBanned), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Rejection::AccountDisabled), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&Rejection::Locked {
                remaining_seconds: 10
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&Rejection::ChallengeRequired {
                remaining_attempts: 2
            }),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(&Rejection::UsernameTaken), StatusCode::CONFLICT);
    }

    #[test]
    fn locked_response_sets_retry_after() {
        let response = rejection_response(&Rejection::Locked {
            remaining_seconds: 120,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("120")
        );
    }
}
