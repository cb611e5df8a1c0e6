//! HTTP surface.
//!
//! Handlers translate login outcomes and RBAC answers into HTTP; every
//! decision is made by [`crate::auth`] and [`crate::rbac`].

use crate::auth::{
    AuthConfig, Authenticator, IdentityStore, JwtIssuer, PgIdentityStore, TokenConfig,
    TracingAuditSink,
};
use crate::clock::{Clock, SystemClock};
use crate::rbac::{seed, PgRbacRepository, RbacAdmin, RbacRepository, RbacResolver};
use crate::store::{EphemeralStore, MemoryStore};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{get, post},
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Shared services handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<Authenticator>,
    pub resolver: Arc<RbacResolver>,
    pub admin: Arc<RbacAdmin>,
    /// Relational pool, pinged by `/health` when present.
    pub pool: Option<PgPool>,
}

/// Everything [`new`] needs besides the listening port.
#[derive(Clone)]
pub struct ServerConfig {
    pub dsn: String,
    pub tokens: TokenConfig,
    pub auth: AuthConfig,
    pub seed_rbac: bool,
}

/// Build the application router around `state`.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/v1/auth/challenge", get(handlers::auth::challenge))
        .route("/v1/auth/login", post(handlers::auth::login))
        .route("/v1/auth/register", post(handlers::auth::register))
        .route("/v1/auth/refresh", post(handlers::auth::refresh))
        .route("/v1/auth/logout", post(handlers::auth::logout))
        .route("/v1/me/roles", get(handlers::rbac::my_roles))
        .route("/v1/me/permissions", get(handlers::rbac::my_permissions))
        .route(
            "/v1/me/permissions/check",
            get(handlers::rbac::check_permission),
        )
        .route("/v1/permissions/tree", get(handlers::rbac::permission_tree))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Wire the production services and serve until interrupted.
///
/// # Errors
/// Return error if the database is unreachable, seeding fails or the listener
/// cannot be bound.
pub async fn new(port: u16, config: ServerConfig) -> Result<()> {
    info!("Connecting to database {}", redacted_dsn(&config.dsn));

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn EphemeralStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
    let repo: Arc<dyn RbacRepository> = Arc::new(PgRbacRepository::new(pool.clone()));
    let identity: Arc<dyn IdentityStore> = Arc::new(PgIdentityStore::new(pool.clone()));

    if config.seed_rbac {
        let report = seed::seed_defaults(repo.as_ref(), clock.now())
            .await
            .context("Failed to seed RBAC catalog")?;
        info!(
            "Seeded {} permissions, {} roles, {} grants",
            report.permissions_created, report.roles_created, report.grants_added
        );
    }

    let tokens = Arc::new(JwtIssuer::new(config.tokens, store.clone(), clock.clone()));
    let auth = Arc::new(Authenticator::new(
        store.clone(),
        clock.clone(),
        identity,
        tokens,
        Arc::new(TracingAuditSink),
        config.auth,
    ));
    let resolver = Arc::new(RbacResolver::new(repo.clone(), store, clock.clone()));
    let admin = Arc::new(RbacAdmin::new(repo, resolver.clone(), clock));

    let app = router(AppState {
        auth,
        resolver,
        admin,
        pool: Some(pool),
    });

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Gracefully shutdown");
        }
    })
    .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

/// The DSN with any password masked, for logs.
fn redacted_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some("****")).is_err() {
                return "<invalid dsn>".to_string();
            }
            url.to_string()
        }
        Err(_) => "<invalid dsn>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_password_is_masked() {
        let masked = redacted_dsn("postgres://bastion:s3cret@db:5432/bastion");
        assert_eq!(masked, "postgres://bastion:****@db:5432/bastion");
        assert!(!masked.contains("s3cret"));
    }

    #[test]
    fn dsn_without_password_is_unchanged() {
        assert_eq!(
            redacted_dsn("postgres://db/bastion"),
            "postgres://db/bastion"
        );
        assert_eq!(redacted_dsn("not a url"), "<invalid dsn>");
    }
}
